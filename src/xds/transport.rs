//! ADS transport channel.
//!
//! One channel per management server. A driver task owns the gRPC
//! connection: it dials with truncated exponential backoff, opens the
//! aggregated bidi stream, and forwards every event (stream up, response,
//! stream down) onto the client serializer, where all protocol state
//! lives: the subscribed-name sets per type, the ACK/NACK version and
//! nonce bookkeeping, and the state-of-the-world deletion sweep. The
//! driver holds only a weak reference to the client; each event upgrades
//! it for the duration of one serializer job.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::Utc;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::google::rpc::Status as RpcStatus;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tracing::{debug, error, info, warn};

use crate::config::{Bootstrap, XdsServerConfig};
use crate::errors::MeshwireError;

use super::backoff::{BackoffConfig, ExponentialBackoff};
use super::cache::{
    deliver_all, CacheEntryStatus, PendingNotification, ResourceKey,
};
use super::client::{ClientInner, ClientState};
use super::name::XdsResourceName;
use super::resource_type::{ops_for_type_url, ResourceTypeOps};
use super::validation::DecodeContext;

/// Commands accepted by the channel driver task.
pub(crate) enum ChannelCommand {
    ResetBackoff,
}

/// Serializer-owned state for one management-server channel.
pub(crate) struct ChannelState {
    pub server: XdsServerConfig,
    cmd_tx: mpsc::UnboundedSender<ChannelCommand>,
    /// Present while an ADS stream is established.
    pub stream: Option<StreamHandle>,
    pub types: HashMap<&'static str, TypeSubscriptionState>,
}

pub(crate) struct StreamHandle {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<DiscoveryRequest>,
    /// Node identity goes out once per stream, on the first request.
    pub node_sent: bool,
}

#[derive(Default)]
pub(crate) struct TypeSubscriptionState {
    pub subscribed: BTreeSet<String>,
    /// Last ACKed version; survives stream restarts.
    pub version: String,
    /// Nonce of the last response on the current stream.
    pub nonce: String,
}

impl ChannelState {
    pub fn request_backoff_reset(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::ResetBackoff);
    }
}

/// Target URI for tonic, honoring the configured channel creds.
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

impl ClientInner {
    pub(crate) fn server_key_for_authority(&self, authority: &str) -> Option<String> {
        self.bootstrap.servers_for_authority(authority).ok().map(|server| server.key())
    }

    /// Add a wire name to a type's subscribed set, creating the channel on
    /// first use. Returns whether the channel currently has a live stream.
    pub(crate) fn subscribe_on_channel(
        self: &Arc<Self>,
        state: &mut ClientState,
        ops: &'static ResourceTypeOps,
        authority: &str,
        wire_name: &str,
    ) -> Result<bool, MeshwireError> {
        let server = self.bootstrap.servers_for_authority(authority)?.clone();
        let server_key = server.key();
        let channel = state.channels.entry(server_key.clone()).or_insert_with(|| {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            spawn_channel_driver(
                Arc::downgrade(self),
                server.clone(),
                server_key.clone(),
                cmd_rx,
                self.shutdown_token.child_token(),
                self.options.backoff.clone(),
            );
            ChannelState { server, cmd_tx, stream: None, types: HashMap::new() }
        });
        let type_state = channel.types.entry(ops.type_url).or_default();
        let inserted = type_state.subscribed.insert(wire_name.to_string());
        if inserted && channel.stream.is_some() {
            send_request_for_type(channel, ops, None, &self.bootstrap);
        }
        Ok(channel.stream.is_some())
    }

    /// Remove a wire name from a type's subscribed set and push the
    /// shrunken set to the server.
    pub(crate) fn unsubscribe_on_channel(
        &self,
        state: &mut ClientState,
        ops: &'static ResourceTypeOps,
        authority: &str,
        wire_name: &str,
    ) {
        let Some(server_key) = self.server_key_for_authority(authority) else {
            return;
        };
        let Some(channel) = state.channels.get_mut(&server_key) else {
            return;
        };
        let Some(type_state) = channel.types.get_mut(ops.type_url) else {
            return;
        };
        if type_state.subscribed.remove(wire_name) && channel.stream.is_some() {
            send_request_for_type(channel, ops, None, &self.bootstrap);
        }
    }

    /// Serializer job: a new stream is live. Re-send subscriptions for
    /// every type and re-arm does-not-exist timers for unanswered names.
    pub(crate) fn on_ads_stream_up(
        self: Arc<Self>,
        server_key: &str,
        stream_id: u64,
        request_tx: mpsc::UnboundedSender<DiscoveryRequest>,
    ) {
        let mut state = self.state.lock().expect("client state lock poisoned");
        let Some(channel) = state.channels.get_mut(server_key) else {
            return;
        };
        channel.stream = Some(StreamHandle { id: stream_id, tx: request_tx, node_sent: false });
        let types_to_request: Vec<&'static ResourceTypeOps> = channel
            .types
            .iter_mut()
            .filter_map(|(type_url, type_state)| {
                type_state.nonce.clear();
                if type_state.subscribed.is_empty() {
                    None
                } else {
                    ops_for_type_url(type_url)
                }
            })
            .collect();
        for ops in types_to_request {
            let channel = state.channels.get_mut(server_key).expect("channel just seen");
            send_request_for_type(channel, ops, None, &self.bootstrap);
        }

        let timeout = self.options.resource_does_not_exist_timeout;
        let requested: Vec<ResourceKey> = state
            .cache
            .entries
            .iter()
            .filter(|(key, entry)| {
                entry.status == CacheEntryStatus::Requested
                    && self.server_key_for_authority(&key.authority).as_deref() == Some(server_key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in requested {
            self.arm_dne_timer(&mut state, &key, timeout);
        }
    }

    /// Serializer job: process one DiscoveryResponse. Decodes and
    /// validates every resource, updates the cache, fans out watcher
    /// notifications, applies SotW deletion, and answers with exactly one
    /// ACK or NACK carrying the response nonce.
    pub(crate) fn on_ads_response(
        self: Arc<Self>,
        server_key: &str,
        stream_id: u64,
        response: DiscoveryResponse,
    ) {
        let mut notifications = Vec::new();
        {
            let mut state = self.state.lock().expect("client state lock poisoned");
            let state = &mut *state;
            let Some(channel) = state.channels.get_mut(server_key) else {
                return;
            };
            match channel.stream.as_ref() {
                Some(stream) if stream.id == stream_id => {}
                _ => return, // stale stream
            }
            let Some(ops) = ops_for_type_url(&response.type_url) else {
                warn!(type_url = %response.type_url, "response for unknown resource type");
                return;
            };
            info!(
                type_url = %response.type_url,
                version = %response.version_info,
                nonce = %response.nonce,
                resource_count = response.resources.len(),
                "received discovery response"
            );
            channel.types.entry(ops.type_url).or_default().nonce = response.nonce.clone();

            let ctx = DecodeContext { bootstrap: &self.bootstrap, features: self.options.features };
            let now = Utc::now();
            let mut rejected: Vec<String> = Vec::new();
            let mut seen: HashSet<ResourceKey> = HashSet::new();

            for (index, any) in response.resources.iter().enumerate() {
                let decoded = (ops.decode)(&ctx, any);
                let Some(name) = decoded.name else {
                    let reason = decoded
                        .parsed
                        .err()
                        .unwrap_or_else(|| "missing resource name".to_string());
                    rejected.push(format!("resource index {}: {}", index, reason));
                    continue;
                };
                let parsed_name = match XdsResourceName::parse(&name, ops.type_path) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        rejected.push(format!("{}: {}", name, e));
                        continue;
                    }
                };
                let key = ResourceKey {
                    type_url: ops.type_url,
                    authority: parsed_name.authority,
                    key: parsed_name.key,
                };
                let Some(entry) = state.cache.entries.get_mut(&key) else {
                    debug!(type_url = ops.type_path, name = %name, "ignoring unsubscribed resource");
                    continue;
                };
                seen.insert(key);
                match decoded.parsed {
                    Ok(resource) => {
                        entry.cancel_timer();
                        let changed = match entry.resource.as_ref() {
                            Some(existing) => !(ops.resources_equal)(existing, &resource),
                            None => true,
                        };
                        entry.status = CacheEntryStatus::Acked;
                        entry.version = response.version_info.clone();
                        entry.update_time = Some(now);
                        entry.serialized_bytes = decoded.serialized;
                        entry.failed_version.clear();
                        entry.failed_details.clear();
                        entry.failed_update_time = None;
                        if changed {
                            entry.resource = Some(resource.clone());
                            entry.notify_all(&mut notifications, |record| {
                                PendingNotification::Changed(record, resource.clone())
                            });
                        } else {
                            debug!(type_url = ops.type_path, name = %name, "resource unchanged");
                        }
                    }
                    Err(details) => {
                        rejected.push(format!("{}: {}", name, details));
                        entry.failed_version = response.version_info.clone();
                        entry.failed_details = details.clone();
                        entry.failed_update_time = Some(now);
                        entry.status = CacheEntryStatus::Nacked;
                        // Stale good data is retained; only watchers that
                        // never saw a value hear about the failure.
                        if entry.resource.is_none() {
                            entry.notify_all(&mut notifications, |record| {
                                PendingNotification::Error(
                                    record,
                                    MeshwireError::validation(details.clone()),
                                )
                            });
                        }
                    }
                }
            }

            // State-of-the-world: a previously present name missing from
            // the response no longer exists.
            if ops.all_resources_required_in_sotw && !channel.server.ignores_resource_deletion() {
                for key in state.cache.keys_for_type(ops.type_url) {
                    if seen.contains(&key) {
                        continue;
                    }
                    if self.server_key_for_authority(&key.authority).as_deref() != Some(server_key)
                    {
                        continue;
                    }
                    let entry = state.cache.entries.get_mut(&key).expect("key just listed");
                    if entry.resource.is_none() {
                        continue;
                    }
                    info!(type_url = ops.type_path, name = %entry.wire_name, "resource no longer exists");
                    entry.status = CacheEntryStatus::DoesNotExist;
                    entry.resource = None;
                    entry.version.clear();
                    entry.notify_all(&mut notifications, PendingNotification::DoesNotExist);
                }
            }

            let channel = state.channels.get_mut(server_key).expect("channel seen above");
            if rejected.is_empty() {
                channel.types.entry(ops.type_url).or_default().version =
                    response.version_info.clone();
                debug!(
                    type_url = %response.type_url,
                    version = %response.version_info,
                    nonce = %response.nonce,
                    "sending ACK"
                );
                send_request_for_type(channel, ops, None, &self.bootstrap);
            } else {
                let detail = rejected.join("; ");
                warn!(
                    type_url = %response.type_url,
                    nonce = %response.nonce,
                    error = %detail,
                    "sending NACK"
                );
                send_request_for_type(channel, ops, Some(detail), &self.bootstrap);
            }
        }
        deliver_all(notifications);
    }

    /// Serializer job: the stream failed. Watchers of never-answered
    /// resources get a transient error; everything ACKed keeps serving
    /// stale data until the stream comes back.
    pub(crate) fn on_ads_stream_down(
        self: Arc<Self>,
        server_key: &str,
        stream_id: u64,
        error: MeshwireError,
    ) {
        let mut notifications = Vec::new();
        {
            let mut state = self.state.lock().expect("client state lock poisoned");
            let state = &mut *state;
            let Some(channel) = state.channels.get_mut(server_key) else {
                return;
            };
            match channel.stream.as_ref() {
                Some(stream) if stream.id == stream_id => {}
                _ => return,
            }
            channel.stream = None;
            for type_state in channel.types.values_mut() {
                type_state.nonce.clear();
            }
            for (key, entry) in state.cache.entries.iter_mut() {
                if self.server_key_for_authority(&key.authority).as_deref() != Some(server_key) {
                    continue;
                }
                if entry.status == CacheEntryStatus::Requested {
                    entry.cancel_timer();
                    entry.notify_all(&mut notifications, |record| {
                        PendingNotification::Error(
                            record,
                            MeshwireError::transport(format!(
                                "ADS stream failed before resource was delivered: {}",
                                error
                            )),
                        )
                    });
                }
            }
        }
        deliver_all(notifications);
    }
}

/// Compose and send the request for one type: the full subscribed-name
/// set, the last ACKed version, the nonce being acknowledged, and the
/// error detail on NACK.
pub(crate) fn send_request_for_type(
    channel: &mut ChannelState,
    ops: &'static ResourceTypeOps,
    error_detail: Option<String>,
    bootstrap: &Bootstrap,
) {
    let ChannelState { stream, types, .. } = channel;
    let Some(stream) = stream.as_mut() else {
        return;
    };
    let type_state = types.entry(ops.type_url).or_default();
    let request = DiscoveryRequest {
        version_info: type_state.version.clone(),
        node: if stream.node_sent { None } else { Some(bootstrap.node_proto()) },
        resource_names: type_state.subscribed.iter().cloned().collect(),
        type_url: ops.type_url.to_string(),
        response_nonce: type_state.nonce.clone(),
        error_detail: error_detail.map(|message| RpcStatus {
            code: tonic::Code::InvalidArgument as i32,
            message,
            ..Default::default()
        }),
        ..Default::default()
    };
    debug!(
        type_url = ops.type_path,
        subscribed = request.resource_names.len(),
        version = %request.version_info,
        nonce = %request.response_nonce,
        nack = request.error_detail.is_some(),
        "sending discovery request"
    );
    if stream.tx.send(request).is_ok() {
        stream.node_sent = true;
    }
}

/// Spawn the connection driver for one management server.
fn spawn_channel_driver(
    inner: Weak<ClientInner>,
    server: XdsServerConfig,
    server_key: String,
    mut cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    token: CancellationToken,
    backoff_config: BackoffConfig,
) {
    tokio::spawn(async move {
        let uri = endpoint_uri(&server);
        let endpoint = match Endpoint::from_shared(uri.clone()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(server = %server.server_uri, error = %e, "invalid management server URI");
                return;
            }
        };
        let mut backoff = ExponentialBackoff::new(backoff_config);
        let mut stream_id: u64 = 0;
        let mut first_attempt = true;

        loop {
            if !first_attempt {
                let delay = backoff.next_delay();
                debug!(server = %server.server_uri, delay_ms = delay.as_millis() as u64, "ADS reconnect backoff");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ChannelCommand::ResetBackoff) => {
                            info!(server = %server.server_uri, "backoff reset; reconnecting immediately");
                        }
                        None => return,
                    }
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
                    warn!(server = %server.server_uri, error = %e, "ADS connection failed");
                    continue;
                }
            };

            let mut client = AggregatedDiscoveryServiceClient::new(connection);
            let (request_tx, request_rx) = mpsc::unbounded_channel::<DiscoveryRequest>();
            let outbound = UnboundedReceiverStream::new(request_rx);
            let call = tokio::select! {
                _ = token.cancelled() => return,
                result = client.stream_aggregated_resources(tonic::Request::new(outbound)) => result,
            };
            let mut responses = match call {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    warn!(server = %server.server_uri, status = %status, "ADS stream rejected");
                    continue;
                }
            };

            stream_id += 1;
            let id = stream_id;
            {
                let Some(client_inner) = inner.upgrade() else { return };
                let job = client_inner.clone();
                let key = server_key.clone();
                client_inner
                    .serializer
                    .post(move || job.on_ads_stream_up(&key, id, request_tx));
            }
            info!(server = %server.server_uri, stream = id, "ADS stream established");

            let failure: MeshwireError = loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    cmd = cmd_rx.recv() => match cmd {
                        // Nothing to cut short while connected.
                        Some(ChannelCommand::ResetBackoff) => {}
                        None => return,
                    },
                    message = responses.message() => match message {
                        Ok(Some(response)) => {
                            backoff.reset();
                            let Some(client_inner) = inner.upgrade() else { return };
                            let job = client_inner.clone();
                            let key = server_key.clone();
                            client_inner
                                .serializer
                                .post(move || job.on_ads_response(&key, id, response));
                        }
                        Ok(None) => break MeshwireError::transport("ADS stream closed by server"),
                        Err(status) => break MeshwireError::from(status),
                    }
                }
            };
            warn!(server = %server.server_uri, stream = id, error = %failure, "ADS stream terminated");
            let Some(client_inner) = inner.upgrade() else { return };
            let job = client_inner.clone();
            let key = server_key.clone();
            client_inner
                .serializer
                .post(move || job.on_ads_stream_down(&key, id, failure));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(uri: &str, creds: &str) -> XdsServerConfig {
        XdsServerConfig {
            server_uri: uri.to_string(),
            channel_creds: vec![crate::config::ChannelCreds {
                r#type: creds.to_string(),
                config: None,
            }],
            server_features: Vec::new(),
        }
    }

    #[test]
    fn endpoint_uri_handles_schemes_and_creds() {
        assert_eq!(endpoint_uri(&server("127.0.0.1:18000", "insecure")), "http://127.0.0.1:18000");
        assert_eq!(
            endpoint_uri(&server("dns:///xds.example.org:443", "tls")),
            "https://xds.example.org:443"
        );
        assert_eq!(
            endpoint_uri(&server("https://already.example", "insecure")),
            "https://already.example"
        );
        assert_eq!(
            endpoint_uri(&server("xds.example.org:443", "google_default")),
            "https://xds.example.org:443"
        );
    }
}
