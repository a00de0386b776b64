//! Shared test infrastructure: an in-process mock management server that
//! tests drive directly, plus builders for the Envoy resource payloads the
//! scenarios use.

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use envoy_types::pb::envoy::config::cluster::v3::{cluster, Cluster};
use envoy_types::pb::envoy::config::core::v3::{
    address, config_source, socket_address, Address, AggregatedConfigSource, ConfigSource,
    SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint,
    LocalityLbEndpoints,
};
use envoy_types::pb::envoy::config::listener::v3::{ApiListener, Listener};
use envoy_types::pb::envoy::config::route::v3::{
    route, route_match, Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost,
};
use envoy_types::pb::envoy::extensions::clusters::aggregate::v3::ClusterConfig as AggregateClusterProto;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::RouteSpecifier, http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::load_stats::v3::load_reporting_service_server::{
    LoadReportingService, LoadReportingServiceServer,
};
use envoy_types::pb::envoy::service::load_stats::v3::{LoadStatsRequest, LoadStatsResponse};
use envoy_types::pb::google::protobuf::Any as ProtoAny;
use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{TcpListenerStream, UnboundedReceiverStream};
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

type AdsResponseTx = mpsc::UnboundedSender<Result<DiscoveryResponse, Status>>;
type LrsResponseTx = mpsc::UnboundedSender<Result<LoadStatsResponse, Status>>;

#[derive(Default)]
struct ServerShared {
    /// Response senders for ADS streams, in connection order.
    ads_streams: Mutex<Vec<AdsResponseTx>>,
    lrs_streams: Mutex<Vec<LrsResponseTx>>,
}

/// Controllable mock management server bound to an ephemeral port.
pub struct MockXdsServer {
    pub address: String,
    shared: Arc<ServerShared>,
    ads_requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<DiscoveryRequest>>,
    lrs_requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<LoadStatsRequest>>,
    connections: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
    server_task: tokio::task::JoinHandle<()>,
}

impl MockXdsServer {
    pub async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr").to_string();
        let shared = Arc::new(ServerShared::default());
        let (ads_request_tx, ads_request_rx) = mpsc::unbounded_channel();
        let (lrs_request_tx, lrs_request_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();

        let ads = MockAds {
            shared: shared.clone(),
            request_tx: ads_request_tx,
            connection_tx,
        };
        let lrs = MockLrs { shared: shared.clone(), request_tx: lrs_request_tx };
        let server_task = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(AggregatedDiscoveryServiceServer::new(ads))
                .add_service(LoadReportingServiceServer::new(lrs))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await;
        });

        Self {
            address,
            shared,
            ads_requests: tokio::sync::Mutex::new(ads_request_rx),
            lrs_requests: tokio::sync::Mutex::new(lrs_request_rx),
            connections: tokio::sync::Mutex::new(connection_rx),
            server_task,
        }
    }

    /// Bootstrap JSON pointing at this server.
    pub fn bootstrap_json(&self) -> String {
        format!(
            r#"{{
                "xds_servers": [
                    {{"server_uri": "{}", "channel_creds": [{{"type": "insecure"}}]}}
                ],
                "node": {{"id": "test-node", "cluster": "test-cluster"}}
            }}"#,
            self.address
        )
    }

    /// Wait for the next ADS stream to be established.
    pub async fn next_connection(&self) {
        self.connections.lock().await.recv().await.expect("server task alive");
    }

    /// Receive the next DiscoveryRequest sent by the client on any stream.
    pub async fn next_request(&self) -> DiscoveryRequest {
        self.ads_requests.lock().await.recv().await.expect("request stream open")
    }

    /// Receive the next request of the given type, skipping others.
    pub async fn next_request_of_type(&self, type_url: &str) -> DiscoveryRequest {
        loop {
            let request = self.next_request().await;
            if request.type_url == type_url {
                return request;
            }
        }
    }

    /// Push a response on the most recent ADS stream.
    pub fn send(&self, response: DiscoveryResponse) {
        let streams = self.shared.ads_streams.lock().expect("ads streams lock");
        let tx = streams.last().expect("no ADS stream established");
        let _ = tx.send(Ok(response));
    }

    /// Terminate the most recent ADS stream with an error status.
    pub fn abort_stream(&self) {
        let streams = self.shared.ads_streams.lock().expect("ads streams lock");
        if let Some(tx) = streams.last() {
            let _ = tx.send(Err(Status::unavailable("test abort")));
        }
    }

    /// Receive the next LoadStatsRequest.
    pub async fn next_lrs_request(&self) -> LoadStatsRequest {
        self.lrs_requests.lock().await.recv().await.expect("lrs request stream open")
    }

    /// Push a response on the most recent LRS stream.
    pub fn send_lrs(&self, response: LoadStatsResponse) {
        let streams = self.shared.lrs_streams.lock().expect("lrs streams lock");
        let tx = streams.last().expect("no LRS stream established");
        let _ = tx.send(Ok(response));
    }
}

impl Drop for MockXdsServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

struct MockAds {
    shared: Arc<ServerShared>,
    request_tx: mpsc::UnboundedSender<DiscoveryRequest>,
    connection_tx: mpsc::UnboundedSender<()>,
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for MockAds {
    type StreamAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
    type DeltaAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        self.shared.ads_streams.lock().expect("ads streams lock").push(response_tx);
        let _ = self.connection_tx.send(());

        let request_tx = self.request_tx.clone();
        let mut in_stream = request.into_inner();
        tokio::spawn(async move {
            while let Ok(Some(discovery_request)) = in_stream.message().await {
                if request_tx.send(discovery_request).is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(response_rx))))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS not supported by mock"))
    }
}

struct MockLrs {
    shared: Arc<ServerShared>,
    request_tx: mpsc::UnboundedSender<LoadStatsRequest>,
}

#[tonic::async_trait]
impl LoadReportingService for MockLrs {
    type StreamLoadStatsStream =
        Pin<Box<dyn Stream<Item = Result<LoadStatsResponse, Status>> + Send>>;

    async fn stream_load_stats(
        &self,
        request: Request<Streaming<LoadStatsRequest>>,
    ) -> Result<Response<Self::StreamLoadStatsStream>, Status> {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        self.shared.lrs_streams.lock().expect("lrs streams lock").push(response_tx);

        let request_tx = self.request_tx.clone();
        let mut in_stream = request.into_inner();
        tokio::spawn(async move {
            while let Ok(Some(load_stats_request)) = in_stream.message().await {
                if request_tx.send(load_stats_request).is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(response_rx))))
    }
}

// ---------------------------------------------------------------------------
// Resource builders
// ---------------------------------------------------------------------------

pub fn any_from<M: Message>(type_url: &str, message: &M) -> ProtoAny {
    ProtoAny { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

pub fn discovery_response(
    type_url: &str,
    version: &str,
    nonce: &str,
    resources: Vec<ProtoAny>,
) -> DiscoveryResponse {
    DiscoveryResponse {
        version_info: version.to_string(),
        resources,
        type_url: type_url.to_string(),
        nonce: nonce.to_string(),
        ..Default::default()
    }
}

fn router_filter() -> HttpFilter {
    HttpFilter {
        name: "router".to_string(),
        config_type: Some(HttpFilterConfigType::TypedConfig(ProtoAny {
            type_url: "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router"
                .to_string(),
            value: Vec::new(),
        })),
        ..Default::default()
    }
}

/// API listener whose connection manager points at an RDS resource.
pub fn listener_with_rds(name: &str, route_config_name: &str) -> Listener {
    let hcm = HttpConnectionManager {
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            config_source: Some(ConfigSource {
                config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
                    AggregatedConfigSource::default(),
                )),
                ..Default::default()
            }),
            route_config_name: route_config_name.to_string(),
        })),
        http_filters: vec![router_filter()],
        ..Default::default()
    };
    Listener {
        name: name.to_string(),
        api_listener: Some(ApiListener {
            api_listener: Some(any_from(
                "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager",
                &hcm,
            )),
        }),
        ..Default::default()
    }
}

/// One-vhost route config: `domains`, single prefix-"" route to `cluster`.
pub fn route_config(name: &str, domains: &[&str], cluster: &str) -> RouteConfiguration {
    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: vec![VirtualHost {
            name: format!("{}-vhost", name),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            routes: vec![Route {
                r#match: Some(RouteMatch {
                    path_specifier: Some(route_match::PathSpecifier::Prefix(String::new())),
                    ..Default::default()
                }),
                action: Some(route::Action::Route(RouteAction {
                    cluster_specifier: Some(
                        envoy_types::pb::envoy::config::route::v3::route_action::ClusterSpecifier::Cluster(
                            cluster.to_string(),
                        ),
                    ),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn eds_cluster(name: &str, eds_service_name: &str) -> Cluster {
    Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Eds as i32,
        )),
        eds_cluster_config: Some(cluster::EdsClusterConfig {
            eds_config: Some(ConfigSource {
                config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
                    AggregatedConfigSource::default(),
                )),
                ..Default::default()
            }),
            service_name: eds_service_name.to_string(),
        }),
        ..Default::default()
    }
}

/// A cluster that fails validation (no discovery type).
pub fn invalid_cluster(name: &str) -> Cluster {
    Cluster { name: name.to_string(), ..Default::default() }
}

pub fn aggregate_cluster(name: &str, children: &[&str]) -> Cluster {
    let config = AggregateClusterProto {
        clusters: children.iter().map(|c| c.to_string()).collect(),
    };
    Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::ClusterType(
            cluster::CustomClusterType {
                name: "envoy.clusters.aggregate".to_string(),
                typed_config: Some(any_from(
                    "type.googleapis.com/envoy.extensions.clusters.aggregate.v3.ClusterConfig",
                    &config,
                )),
            },
        )),
        ..Default::default()
    }
}

/// Single-locality, single-endpoint load assignment.
pub fn cluster_load_assignment(name: &str, ip: &str, port: u32) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: name.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            locality: Some(envoy_types::pb::envoy::config::core::v3::Locality {
                region: "region1".to_string(),
                zone: "zone1".to_string(),
                sub_zone: String::new(),
            }),
            load_balancing_weight: Some(envoy_types::pb::google::protobuf::UInt32Value {
                value: 1,
            }),
            lb_endpoints: vec![LbEndpoint {
                host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                    address: Some(Address {
                        address: Some(address::Address::SocketAddress(SocketAddress {
                            address: ip.to_string(),
                            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
                            ..Default::default()
                        })),
                    }),
                    ..Default::default()
                })),
                load_balancing_weight: Some(envoy_types::pb::google::protobuf::UInt32Value {
                    value: 1,
                }),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Test watchers
// ---------------------------------------------------------------------------

/// Watcher event captured by the test doubles below.
#[derive(Debug)]
pub enum WatchEvent<T> {
    Changed(Arc<T>),
    Error(meshwire::Error),
    DoesNotExist,
}

/// Channel-backed resource watcher.
pub struct RecordingWatcher<T> {
    tx: mpsc::UnboundedSender<WatchEvent<T>>,
}

impl<T> RecordingWatcher<T> {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WatchEvent<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl<T: meshwire::xds::ResourceType<Resource = T> + Send + Sync + 'static>
    meshwire::ResourceWatcher<T> for RecordingWatcher<T>
{
    fn on_resource_changed(&self, resource: Arc<T>) {
        let _ = self.tx.send(WatchEvent::Changed(resource));
    }

    fn on_error(&self, error: meshwire::Error) {
        let _ = self.tx.send(WatchEvent::Error(error));
    }

    fn on_resource_does_not_exist(&self) {
        let _ = self.tx.send(WatchEvent::DoesNotExist);
    }
}

/// Channel-backed dependency-manager watcher.
#[derive(Debug)]
pub enum ConfigEvent {
    Update(Arc<meshwire::XdsConfig>),
    Error(String, meshwire::Error),
    DoesNotExist(String),
}

pub struct RecordingConfigWatcher {
    tx: mpsc::UnboundedSender<ConfigEvent>,
}

impl RecordingConfigWatcher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConfigEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl meshwire::ConfigWatcher for RecordingConfigWatcher {
    fn on_update(&self, config: Arc<meshwire::XdsConfig>) {
        let _ = self.tx.send(ConfigEvent::Update(config));
    }

    fn on_error(&self, context: &str, error: meshwire::Error) {
        let _ = self.tx.send(ConfigEvent::Error(context.to_string(), error));
    }

    fn on_resource_does_not_exist(&self, context: &str) {
        let _ = self.tx.send(ConfigEvent::DoesNotExist(context.to_string()));
    }
}

/// Short-timer client options for tests.
pub fn test_options() -> meshwire::XdsClientOptions {
    meshwire::XdsClientOptions {
        resource_does_not_exist_timeout: std::time::Duration::from_secs(1),
        backoff: meshwire::xds::backoff::BackoffConfig {
            initial: std::time::Duration::from_millis(50),
            multiplier: 1.6,
            max: std::time::Duration::from_secs(1),
            jitter: 0.2,
        },
        ..Default::default()
    }
}

/// Build a client against the mock server with test options.
pub fn test_client(server: &MockXdsServer) -> meshwire::XdsClient {
    let bootstrap = meshwire::Bootstrap::from_json(&server.bootstrap_json()).expect("bootstrap");
    meshwire::XdsClient::new(bootstrap, test_options()).expect("client")
}
