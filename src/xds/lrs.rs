//! Load Reporting Service stream.
//!
//! One LRS stream per management server, opened when the first drop- or
//! locality-stats handle for that server is created and closed when the
//! store runs dry. The server dictates the reporting interval and which
//! clusters to report; every interval the client snapshots and atomically
//! resets the counters and sends one `LoadStatsRequest`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use envoy_types::pb::envoy::config::endpoint::v3::{
    cluster_stats, ClusterStats, EndpointLoadMetricStats, UpstreamLocalityStats,
};
use envoy_types::pb::envoy::config::core::v3::Locality as ProtoLocality;
use envoy_types::pb::envoy::service::load_stats::v3::load_reporting_service_client::LoadReportingServiceClient;
use envoy_types::pb::envoy::service::load_stats::v3::{LoadStatsRequest, LoadStatsResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tracing::{debug, info, warn};

use crate::config::XdsServerConfig;

use super::backoff::ExponentialBackoff;
use super::client::ClientInner;
use super::stats::ClusterStatsReport;

const DEFAULT_LOAD_REPORTING_INTERVAL: Duration = Duration::from_secs(10);

/// Tracks which servers currently have an LRS task running.
pub(crate) struct LrsChannels {
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl LrsChannels {
    pub fn new() -> Self {
        Self { active: Mutex::new(HashMap::new()) }
    }

    /// Start the LRS task for a server if it is not already running.
    pub fn ensure_channel(&self, client: &Arc<ClientInner>, server_key: String) {
        let mut active = self.active.lock().expect("lrs channel map lock poisoned");
        if active.contains_key(&server_key) {
            return;
        }
        let Some(server) = find_server(client, &server_key) else {
            warn!(server = %server_key, "no bootstrap server for LRS reporting");
            return;
        };
        let token = client.shutdown_token.child_token();
        active.insert(server_key.clone(), token.clone());
        spawn_lrs_task(Arc::downgrade(client), server, server_key, token);
    }

    fn channel_closed(&self, server_key: &str) {
        let mut active = self.active.lock().expect("lrs channel map lock poisoned");
        if let Some(token) = active.remove(server_key) {
            token.cancel();
        }
    }
}

fn find_server(client: &ClientInner, server_key: &str) -> Option<XdsServerConfig> {
    client
        .bootstrap
        .xds_servers
        .iter()
        .chain(client.bootstrap.authorities.values().flat_map(|a| a.xds_servers.iter()))
        .find(|server| server.key() == server_key)
        .cloned()
}

fn endpoint_uri(server: &XdsServerConfig) -> String {
    let target = server.server_uri.strip_prefix("dns:///").unwrap_or(&server.server_uri);
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    let tls = server.channel_creds.iter().any(|c| c.r#type == "tls" || c.r#type == "google_default");
    if tls {
        format!("https://{}", target)
    } else {
        format!("http://{}", target)
    }
}

fn spawn_lrs_task(
    inner: Weak<ClientInner>,
    server: XdsServerConfig,
    server_key: String,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let uri = endpoint_uri(&server);
        let Ok(endpoint) = Endpoint::from_shared(uri) else {
            warn!(server = %server.server_uri, "invalid LRS server URI");
            return;
        };
        let backoff_config = match inner.upgrade() {
            Some(client) => client.options.backoff.clone(),
            None => return,
        };
        let mut backoff = ExponentialBackoff::new(backoff_config);
        let mut first_attempt = true;

        loop {
            if !first_attempt {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first_attempt = false;

            let connection = tokio::select! {
                _ = token.cancelled() => return,
                result = endpoint.connect() => result,
            };
            let connection = match connection {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(server = %server.server_uri, error = %e, "LRS connection failed");
                    continue;
                }
            };
            let mut client = LoadReportingServiceClient::new(connection);
            let (request_tx, request_rx) = mpsc::unbounded_channel::<LoadStatsRequest>();
            let outbound = UnboundedReceiverStream::new(request_rx);
            let call = tokio::select! {
                _ = token.cancelled() => return,
                result = client.stream_load_stats(tonic::Request::new(outbound)) => result,
            };
            let mut responses = match call {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    warn!(server = %server.server_uri, status = %status, "LRS stream rejected");
                    continue;
                }
            };

            // Initial request carries node identity only.
            {
                let Some(client_inner) = inner.upgrade() else { return };
                let initial = LoadStatsRequest {
                    node: Some(client_inner.bootstrap.node_proto()),
                    cluster_stats: Vec::new(),
                };
                if request_tx.send(initial).is_err() {
                    continue;
                }
            }
            info!(server = %server.server_uri, "LRS stream established");

            let mut interval = DEFAULT_LOAD_REPORTING_INTERVAL;
            let mut send_all_clusters = false;
            let mut cluster_filter: Vec<String> = Vec::new();
            let mut have_directive = false;
            let mut last_report = tokio::time::Instant::now();

            loop {
                let sleep_until = last_report + interval;
                tokio::select! {
                    _ = token.cancelled() => return,
                    message = responses.message() => match message {
                        Ok(Some(response)) => {
                            backoff.reset();
                            apply_directive(
                                &response,
                                &mut interval,
                                &mut send_all_clusters,
                                &mut cluster_filter,
                            );
                            have_directive = true;
                        }
                        Ok(None) => {
                            warn!(server = %server.server_uri, "LRS stream closed by server");
                            break;
                        }
                        Err(status) => {
                            warn!(server = %server.server_uri, status = %status, "LRS stream failed");
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(sleep_until), if have_directive => {
                        let Some(client_inner) = inner.upgrade() else { return };
                        let elapsed = last_report.elapsed();
                        last_report = tokio::time::Instant::now();

                        if !client_inner.load_reports.has_stats_for_server(&server_key) {
                            info!(server = %server.server_uri, "no load-report handles left; closing LRS stream");
                            client_inner.lrs.channel_closed(&server_key);
                            return;
                        }
                        let mut reports =
                            client_inner.load_reports.collect_reports(&server_key);
                        if !send_all_clusters {
                            reports.retain(|report| cluster_filter.contains(&report.cluster_name));
                        }
                        let request = LoadStatsRequest {
                            node: None,
                            cluster_stats: reports
                                .into_iter()
                                .map(|report| cluster_stats_proto(report, elapsed))
                                .collect(),
                        };
                        debug!(
                            server = %server.server_uri,
                            clusters = request.cluster_stats.len(),
                            "sending load report"
                        );
                        if request_tx.send(request).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
}

fn apply_directive(
    response: &LoadStatsResponse,
    interval: &mut Duration,
    send_all_clusters: &mut bool,
    cluster_filter: &mut Vec<String>,
) {
    *send_all_clusters = response.send_all_clusters;
    *cluster_filter = response.clusters.clone();
    if let Some(proto_interval) = response.load_reporting_interval.as_ref() {
        let seconds = proto_interval.seconds.max(0) as u64;
        let nanos = proto_interval.nanos.max(0) as u32;
        let parsed = Duration::new(seconds, nanos);
        if parsed > Duration::ZERO {
            *interval = parsed;
        }
    }
    debug!(
        send_all = *send_all_clusters,
        clusters = cluster_filter.len(),
        interval_ms = interval.as_millis() as u64,
        "LRS reporting directive"
    );
}

fn cluster_stats_proto(report: ClusterStatsReport, elapsed: Duration) -> ClusterStats {
    let total_dropped_requests = report.dropped.total();
    ClusterStats {
        cluster_name: report.cluster_name,
        cluster_service_name: report.eds_service_name,
        upstream_locality_stats: report
            .localities
            .into_iter()
            .map(|(name, snapshot)| UpstreamLocalityStats {
                locality: Some(ProtoLocality {
                    region: name.region,
                    zone: name.zone,
                    sub_zone: name.sub_zone,
                }),
                total_successful_requests: snapshot.total_successful_requests,
                total_requests_in_progress: snapshot.total_requests_in_progress.max(0) as u64,
                total_error_requests: snapshot.total_error_requests,
                total_issued_requests: snapshot.total_issued_requests,
                load_metric_stats: snapshot
                    .backend_metrics
                    .into_iter()
                    .map(|(metric_name, metric)| EndpointLoadMetricStats {
                        metric_name,
                        num_requests_finished_with_metric: metric
                            .num_requests_finished_with_metric,
                        total_metric_value: metric.total_metric_value,
                    })
                    .collect(),
                ..Default::default()
            })
            .collect(),
        total_dropped_requests,
        dropped_requests: report
            .dropped
            .categorized_drops
            .into_iter()
            .map(|(category, dropped_count)| cluster_stats::DroppedRequests {
                category,
                dropped_count,
            })
            .collect(),
        load_report_interval: Some(envoy_types::pb::google::protobuf::Duration {
            seconds: elapsed.as_secs() as i64,
            nanos: elapsed.subsec_nanos() as i32,
        }),
        ..Default::default()
    }
}
