//! Cluster resource validation using envoy-types.
//!
//! Clusters come in three kinds: EDS (endpoints fetched as a separate
//! resource), LOGICAL_DNS (a hostname resolved out-of-band), and AGGREGATE
//! (an ordered union of other clusters). The load-balancing policy is
//! normalized into a JSON tree that LB policy registries consume; the
//! client does not interpret it further.

use std::time::Duration;

use envoy_types::pb::envoy::config::cluster::v3::{
    cluster, Cluster, OutlierDetection as ProtoOutlierDetection,
};
use envoy_types::pb::envoy::config::core::v3::{
    address, config_source::ConfigSourceSpecifier, socket_address, RoutingPriority,
    TransportSocket,
};
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::extensions::clusters::aggregate::v3::ClusterConfig as AggregateProto;
use envoy_types::pb::envoy::extensions::load_balancing_policies::ring_hash::v3::RingHash as RingHashProto;
use envoy_types::pb::envoy::extensions::load_balancing_policies::wrr_locality::v3::WrrLocality as WrrLocalityProto;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context::ValidationContextType, UpstreamTlsContext,
};
use prost::Message;
use serde_json::json;

use super::endpoint::HealthStatus;
use super::filters::proto_type_path;
use super::resource_type::ResourceType;
use super::validation::{validate_proto_duration, DecodeContext, ValidationErrors};

const AGGREGATE_CLUSTER_TYPE_NAME: &str = "envoy.clusters.aggregate";
const AGGREGATE_CLUSTER_CONFIG_TYPE: &str = "envoy.extensions.clusters.aggregate.v3.ClusterConfig";
const TLS_TRANSPORT_SOCKET_NAME: &str = "envoy.transport_sockets.tls";
const UPSTREAM_TLS_CONTEXT_TYPE: &str =
    "envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

const ROUND_ROBIN_POLICY_TYPE: &str =
    "envoy.extensions.load_balancing_policies.round_robin.v3.RoundRobin";
const RING_HASH_POLICY_TYPE: &str =
    "envoy.extensions.load_balancing_policies.ring_hash.v3.RingHash";
const WRR_LOCALITY_POLICY_TYPE: &str =
    "envoy.extensions.load_balancing_policies.wrr_locality.v3.WrrLocality";

const DEFAULT_MAX_CONCURRENT_REQUESTS: u32 = 1024;
const MAX_RING_SIZE: u64 = 8_388_608;
const LB_POLICY_RECURSION_DEPTH: usize = 16;

/// Validated Cluster resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResource {
    pub kind: ClusterKind,
    /// Load-balancing policy as a JSON tree, e.g.
    /// `{"wrr_locality": {"child_policy": {"round_robin": {}}}}`.
    pub lb_policy_config: serde_json::Value,
    /// Set when the cluster asks for load reporting; only the self server
    /// (the balancer the cluster came from) is expressible.
    pub lrs_load_reporting_server: Option<LrsServer>,
    pub max_concurrent_requests: u32,
    pub outlier_detection: Option<OutlierDetectionConfig>,
    pub tls_context: Option<TlsContextConfig>,
    /// Health statuses allowed for host overrides; empty unless the
    /// override-host feature is enabled.
    pub override_host_statuses: Vec<HealthStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterKind {
    /// Endpoints fetched via EDS under this service name.
    Eds { eds_service_name: String },
    /// Hostname resolved by the external DNS resolver.
    LogicalDns { hostname: String },
    /// Ordered union of other clusters.
    Aggregate { prioritized_cluster_names: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrsServer {
    /// Report load to the same server the cluster was obtained from.
    SelfServer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutlierDetectionConfig {
    pub interval: Duration,
    pub base_ejection_time: Duration,
    pub max_ejection_time: Duration,
    pub max_ejection_percent: u32,
    pub success_rate_ejection: Option<SuccessRateEjection>,
    pub failure_percentage_ejection: Option<FailurePercentageEjection>,
}

impl Default for OutlierDetectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            base_ejection_time: Duration::from_secs(30),
            max_ejection_time: Duration::from_secs(300),
            max_ejection_percent: 10,
            success_rate_ejection: None,
            failure_percentage_ejection: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuccessRateEjection {
    pub stdev_factor: u32,
    pub enforcement_percentage: u32,
    pub minimum_hosts: u32,
    pub request_volume: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailurePercentageEjection {
    pub threshold: u32,
    pub enforcement_percentage: u32,
    pub minimum_hosts: u32,
    pub request_volume: u32,
}

/// TLS configuration reduced to the certificate-provider references the
/// bootstrap declares.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsContextConfig {
    pub ca_certificate_provider_instance: String,
    pub ca_certificate_name: String,
}

impl ResourceType for ClusterResource {
    const TYPE_PATH: &'static str = "envoy.config.cluster.v3.Cluster";
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;

    type Proto = Cluster;
    type Resource = ClusterResource;

    fn proto_resource_name(proto: &Cluster) -> String {
        proto.name.clone()
    }

    fn validate(
        ctx: &DecodeContext<'_>,
        proto: Cluster,
    ) -> Result<ClusterResource, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let kind = validate_discovery_type(&proto, &mut errors);

        let lb_policy_config = errors.scoped("load_balancing_policy", |errors| {
            validate_lb_policy(&proto, errors)
        });

        let lrs_load_reporting_server = proto.lrs_server.as_ref().and_then(|source| {
            errors.scoped("lrs_server", |errors| {
                match source.config_source_specifier {
                    Some(ConfigSourceSpecifier::Self_(_)) => Some(LrsServer::SelfServer),
                    _ => {
                        errors.add("ConfigSource is not self");
                        None
                    }
                }
            })
        });

        let max_concurrent_requests = max_concurrent_requests(&proto);

        let outlier_detection = proto.outlier_detection.as_ref().and_then(|od| {
            errors.scoped("outlier_detection", |errors| validate_outlier_detection(od, errors))
        });

        let tls_context = proto.transport_socket.as_ref().and_then(|socket| {
            errors.scoped("transport_socket", |errors| {
                validate_transport_socket(ctx, socket, errors)
            })
        });

        let override_host_statuses = if ctx.features.override_host_status {
            override_host_statuses(&proto)
        } else {
            Vec::new()
        };

        let kind = match kind {
            Some(kind) => kind,
            None => return Err(errors),
        };
        errors.into_result(ClusterResource {
            kind,
            lb_policy_config: lb_policy_config.unwrap_or(serde_json::Value::Null),
            lrs_load_reporting_server,
            max_concurrent_requests,
            outlier_detection,
            tls_context,
            override_host_statuses,
        })
    }
}

fn validate_discovery_type(proto: &Cluster, errors: &mut ValidationErrors) -> Option<ClusterKind> {
    match proto.cluster_discovery_type.as_ref() {
        Some(cluster::ClusterDiscoveryType::Type(discovery_type)) => {
            match cluster::DiscoveryType::try_from(*discovery_type) {
                Ok(cluster::DiscoveryType::Eds) => {
                    errors.scoped("eds_cluster_config", |errors| {
                        validate_eds_config(proto, errors)
                    })
                }
                Ok(cluster::DiscoveryType::LogicalDns) => {
                    errors.scoped("load_assignment", |errors| {
                        validate_logical_dns(proto.load_assignment.as_ref(), errors)
                    })
                }
                _ => {
                    errors.add_at("type", "unknown discovery type");
                    None
                }
            }
        }
        Some(cluster::ClusterDiscoveryType::ClusterType(custom)) => {
            errors.scoped("cluster_type", |errors| {
                if custom.name != AGGREGATE_CLUSTER_TYPE_NAME {
                    errors.add_at("name", format!("unknown cluster type '{}'", custom.name));
                    return None;
                }
                let any = match custom.typed_config.as_ref() {
                    Some(any) => any,
                    None => {
                        errors.add_at("typed_config", "field not present");
                        return None;
                    }
                };
                if proto_type_path(&any.type_url) != AGGREGATE_CLUSTER_CONFIG_TYPE {
                    errors.add_at(
                        "typed_config",
                        format!("unsupported aggregate cluster config type '{}'", any.type_url),
                    );
                    return None;
                }
                let config = match AggregateProto::decode(&any.value[..]) {
                    Ok(config) => config,
                    Err(e) => {
                        errors.add_at(
                            "typed_config",
                            format!("could not parse aggregate cluster config: {}", e),
                        );
                        return None;
                    }
                };
                if config.clusters.is_empty() {
                    errors.add_at("typed_config.clusters", "must be non-empty");
                    return None;
                }
                Some(ClusterKind::Aggregate { prioritized_cluster_names: config.clusters })
            })
        }
        None => {
            errors.add("DiscoveryType is not valid");
            None
        }
    }
}

fn validate_eds_config(proto: &Cluster, errors: &mut ValidationErrors) -> Option<ClusterKind> {
    if let Some(eds_config) = proto.eds_cluster_config.as_ref().and_then(|c| c.eds_config.as_ref())
    {
        let ok = matches!(
            eds_config.config_source_specifier,
            Some(ConfigSourceSpecifier::Ads(_)) | Some(ConfigSourceSpecifier::Self_(_))
        );
        if !ok {
            errors.add_at("eds_config", "ConfigSource is not ads or self");
        }
    }
    let eds_service_name = proto
        .eds_cluster_config
        .as_ref()
        .map(|c| c.service_name.clone())
        .unwrap_or_default();
    if eds_service_name.is_empty() {
        // xdstp cluster names are not valid EDS service names, so an
        // explicit one is required there.
        if proto.name.starts_with("xdstp:") {
            errors.add_at("service_name", "must be set if Cluster resource has an xdstp name");
            return None;
        }
        return Some(ClusterKind::Eds { eds_service_name: proto.name.clone() });
    }
    Some(ClusterKind::Eds { eds_service_name })
}

fn validate_logical_dns(
    load_assignment: Option<&ClusterLoadAssignment>,
    errors: &mut ValidationErrors,
) -> Option<ClusterKind> {
    let Some(load_assignment) = load_assignment else {
        errors.add("field not present for LOGICAL_DNS cluster");
        return None;
    };
    if load_assignment.endpoints.len() != 1 {
        errors.add_at("endpoints", "must contain exactly one locality for LOGICAL_DNS cluster");
        return None;
    }
    let locality = &load_assignment.endpoints[0];
    if locality.lb_endpoints.len() != 1 {
        errors.add_at(
            "endpoints[0].lb_endpoints",
            "must contain exactly one endpoint for LOGICAL_DNS cluster",
        );
        return None;
    }
    let endpoint = &locality.lb_endpoints[0];
    let socket_address = match endpoint.host_identifier.as_ref() {
        Some(envoy_types::pb::envoy::config::endpoint::v3::lb_endpoint::HostIdentifier::Endpoint(
            endpoint,
        )) => endpoint
            .address
            .as_ref()
            .and_then(|a| a.address.as_ref())
            .and_then(|a| match a {
                address::Address::SocketAddress(socket_address) => Some(socket_address),
                _ => None,
            }),
        _ => None,
    };
    let Some(socket_address) = socket_address else {
        errors.add_at(
            "endpoints[0].lb_endpoints[0].endpoint.address.socket_address",
            "field not present",
        );
        return None;
    };
    if !socket_address.resolver_name.is_empty() {
        errors.add_at(
            "endpoints[0].lb_endpoints[0].endpoint.address.socket_address.resolver_name",
            "LOGICAL_DNS clusters must not specify a custom resolver name",
        );
        return None;
    }
    if socket_address.address.is_empty() {
        errors.add_at(
            "endpoints[0].lb_endpoints[0].endpoint.address.socket_address.address",
            "field not present",
        );
        return None;
    }
    let port = match socket_address.port_specifier.as_ref() {
        Some(socket_address::PortSpecifier::PortValue(port)) => *port,
        _ => {
            errors.add_at(
                "endpoints[0].lb_endpoints[0].endpoint.address.socket_address.port_value",
                "field not present",
            );
            return None;
        }
    };
    Some(ClusterKind::LogicalDns {
        hostname: format!("{}:{}", socket_address.address, port),
    })
}

fn validate_lb_policy(proto: &Cluster, errors: &mut ValidationErrors) -> Option<serde_json::Value> {
    // The newer typed load_balancing_policy field wins over the legacy enum.
    if let Some(policy) = proto.load_balancing_policy.as_ref() {
        return convert_lb_policy_list(policy, 0, errors);
    }
    match cluster::LbPolicy::try_from(proto.lb_policy) {
        Ok(cluster::LbPolicy::RoundRobin) => Some(json!({
            "wrr_locality": {"child_policy": {"round_robin": {}}}
        })),
        Ok(cluster::LbPolicy::RingHash) => {
            let config = match proto.lb_config.as_ref() {
                Some(cluster::LbConfig::RingHashLbConfig(c)) => Some(c),
                _ => None,
            };
            let min = config
                .and_then(|c| c.minimum_ring_size.as_ref())
                .map(|v| v.value)
                .unwrap_or(1024);
            let max = config
                .and_then(|c| c.maximum_ring_size.as_ref())
                .map(|v| v.value)
                .unwrap_or(MAX_RING_SIZE);
            if let Some(config) = config {
                if cluster::ring_hash_lb_config::HashFunction::try_from(config.hash_function)
                    != Ok(cluster::ring_hash_lb_config::HashFunction::XxHash)
                {
                    errors.add_at("ring_hash_lb_config.hash_function", "invalid hash function");
                    return None;
                }
            }
            ring_hash_json(min, max, errors)
        }
        _ => {
            errors.add_at("lb_policy", format!("LB policy {} is not supported", proto.lb_policy));
            None
        }
    }
}

fn ring_hash_json(min: u64, max: u64, errors: &mut ValidationErrors) -> Option<serde_json::Value> {
    let mut ok = true;
    if min == 0 || min > MAX_RING_SIZE {
        errors.add_at("minimum_ring_size", "must be in the range of 1 to 8388608");
        ok = false;
    }
    if max == 0 || max > MAX_RING_SIZE {
        errors.add_at("maximum_ring_size", "must be in the range of 1 to 8388608");
        ok = false;
    }
    if ok && min > max {
        errors.add_at(
            "minimum_ring_size",
            "cannot be greater than maximum_ring_size",
        );
        ok = false;
    }
    if !ok {
        return None;
    }
    Some(json!({"ring_hash": {"min_ring_size": min, "max_ring_size": max}}))
}

fn convert_lb_policy_list(
    policy: &envoy_types::pb::envoy::config::cluster::v3::LoadBalancingPolicy,
    depth: usize,
    errors: &mut ValidationErrors,
) -> Option<serde_json::Value> {
    if depth >= LB_POLICY_RECURSION_DEPTH {
        errors.add(format!("exceeded max recursion depth of {}", LB_POLICY_RECURSION_DEPTH));
        return None;
    }
    // The first supported policy in the list wins.
    for (i, entry) in policy.policies.iter().enumerate() {
        let Some(extension) = entry.typed_extension_config.as_ref() else {
            continue;
        };
        let Some(any) = extension.typed_config.as_ref() else {
            continue;
        };
        let result = errors.scoped(format!("policies[{}].typed_extension_config.typed_config", i), |errors| {
            match proto_type_path(&any.type_url) {
                ROUND_ROBIN_POLICY_TYPE => Some(Some(json!({"round_robin": {}}))),
                RING_HASH_POLICY_TYPE => {
                    let config = match RingHashProto::decode(&any.value[..]) {
                        Ok(config) => config,
                        Err(e) => {
                            errors.add(format!("could not parse RingHash config: {}", e));
                            return Some(None);
                        }
                    };
                    use envoy_types::pb::envoy::extensions::load_balancing_policies::ring_hash::v3::ring_hash::HashFunction;
                    match HashFunction::try_from(config.hash_function) {
                        Ok(HashFunction::DefaultHash) | Ok(HashFunction::XxHash) => {}
                        _ => {
                            errors.add_at("hash_function", "unsupported hash function");
                            return Some(None);
                        }
                    }
                    let min =
                        config.minimum_ring_size.as_ref().map(|v| v.value).unwrap_or(1024);
                    let max = config
                        .maximum_ring_size
                        .as_ref()
                        .map(|v| v.value)
                        .unwrap_or(MAX_RING_SIZE);
                    Some(ring_hash_json(min, max, errors))
                }
                WRR_LOCALITY_POLICY_TYPE => {
                    let config = match WrrLocalityProto::decode(&any.value[..]) {
                        Ok(config) => config,
                        Err(e) => {
                            errors.add(format!("could not parse WrrLocality config: {}", e));
                            return Some(None);
                        }
                    };
                    let Some(child) = config.endpoint_picking_policy.as_ref() else {
                        errors.add_at("endpoint_picking_policy", "field not present");
                        return Some(None);
                    };
                    let child_json = errors.scoped("endpoint_picking_policy", |errors| {
                        convert_lb_policy_list(child, depth + 1, errors)
                    });
                    match child_json {
                        Some(child_json) => {
                            Some(Some(json!({"wrr_locality": {"child_policy": child_json}})))
                        }
                        None => Some(None),
                    }
                }
                // Unknown policy types are skipped; a later entry may be
                // supported.
                _ => None,
            }
        });
        if let Some(result) = result {
            return result;
        }
    }
    errors.add("no supported load balancing policy found");
    None
}

fn max_concurrent_requests(proto: &Cluster) -> u32 {
    let thresholds = match proto.circuit_breakers.as_ref() {
        Some(breakers) => &breakers.thresholds,
        None => return DEFAULT_MAX_CONCURRENT_REQUESTS,
    };
    for threshold in thresholds {
        if threshold.priority == RoutingPriority::Default as i32 {
            if let Some(max_requests) = threshold.max_requests.as_ref() {
                return max_requests.value;
            }
        }
    }
    DEFAULT_MAX_CONCURRENT_REQUESTS
}

fn validate_outlier_detection(
    od: &ProtoOutlierDetection,
    errors: &mut ValidationErrors,
) -> Option<OutlierDetectionConfig> {
    let mut config = OutlierDetectionConfig::default();
    let error_count_before = errors.len();

    if let Some(duration) = od.interval.as_ref() {
        if let Some(interval) =
            errors.scoped("interval", |errors| validate_proto_duration(duration, errors))
        {
            config.interval = interval;
        }
    }
    if let Some(duration) = od.base_ejection_time.as_ref() {
        if let Some(base) = errors
            .scoped("base_ejection_time", |errors| validate_proto_duration(duration, errors))
        {
            config.base_ejection_time = base;
        }
    }
    if let Some(duration) = od.max_ejection_time.as_ref() {
        if let Some(max) =
            errors.scoped("max_ejection_time", |errors| validate_proto_duration(duration, errors))
        {
            config.max_ejection_time = max;
        }
    } else {
        config.max_ejection_time =
            std::cmp::max(config.base_ejection_time, Duration::from_secs(300));
    }

    let mut percentage = |value: Option<u32>, field: &str, default: u32| -> u32 {
        let value = value.unwrap_or(default);
        if value > 100 {
            errors.add_at(field, "value must be <= 100");
        }
        value
    };
    let max_ejection_percent =
        percentage(od.max_ejection_percent.as_ref().map(|v| v.value), "max_ejection_percent", 10);
    let enforcing_success_rate = percentage(
        od.enforcing_success_rate.as_ref().map(|v| v.value),
        "enforcing_success_rate",
        100,
    );
    let failure_percentage_threshold = percentage(
        od.failure_percentage_threshold.as_ref().map(|v| v.value),
        "failure_percentage_threshold",
        85,
    );
    let enforcing_failure_percentage = percentage(
        od.enforcing_failure_percentage.as_ref().map(|v| v.value),
        "enforcing_failure_percentage",
        0,
    );
    config.max_ejection_percent = max_ejection_percent;

    if enforcing_success_rate > 0 {
        config.success_rate_ejection = Some(SuccessRateEjection {
            stdev_factor: od.success_rate_stdev_factor.as_ref().map(|v| v.value).unwrap_or(1900),
            enforcement_percentage: enforcing_success_rate,
            minimum_hosts: od.success_rate_minimum_hosts.as_ref().map(|v| v.value).unwrap_or(5),
            request_volume: od.success_rate_request_volume.as_ref().map(|v| v.value).unwrap_or(100),
        });
    }
    if enforcing_failure_percentage > 0 {
        config.failure_percentage_ejection = Some(FailurePercentageEjection {
            threshold: failure_percentage_threshold,
            enforcement_percentage: enforcing_failure_percentage,
            minimum_hosts: od
                .failure_percentage_minimum_hosts
                .as_ref()
                .map(|v| v.value)
                .unwrap_or(5),
            request_volume: od
                .failure_percentage_request_volume
                .as_ref()
                .map(|v| v.value)
                .unwrap_or(50),
        });
    }

    if errors.len() > error_count_before {
        None
    } else {
        Some(config)
    }
}

fn validate_transport_socket(
    ctx: &DecodeContext<'_>,
    socket: &TransportSocket,
    errors: &mut ValidationErrors,
) -> Option<TlsContextConfig> {
    if socket.name != TLS_TRANSPORT_SOCKET_NAME {
        errors.add_at("name", format!("unrecognized transport socket '{}'", socket.name));
        return None;
    }
    let any = match socket.config_type.as_ref() {
        Some(envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType::TypedConfig(
            any,
        )) => any,
        None => {
            errors.add_at("typed_config", "field not present");
            return None;
        }
    };
    if proto_type_path(&any.type_url) != UPSTREAM_TLS_CONTEXT_TYPE {
        errors.add_at(
            "typed_config",
            format!("unrecognized transport socket type '{}'", any.type_url),
        );
        return None;
    }
    let tls_context = match UpstreamTlsContext::decode(&any.value[..]) {
        Ok(tls_context) => tls_context,
        Err(e) => {
            errors.add_at("typed_config", format!("could not parse UpstreamTlsContext: {}", e));
            return None;
        }
    };
    errors.scoped("typed_config.common_tls_context", |errors| {
        let Some(common) = tls_context.common_tls_context.as_ref() else {
            errors.add("field not present");
            return None;
        };
        let validation_context = match common.validation_context_type.as_ref() {
            Some(ValidationContextType::ValidationContext(vc)) => Some(vc),
            Some(ValidationContextType::CombinedValidationContext(combined)) => {
                combined.default_validation_context.as_ref()
            }
            _ => None,
        };
        let provider = validation_context
            .and_then(|vc| vc.ca_certificate_provider_instance.as_ref());
        let Some(provider) = provider else {
            errors.add("no CA certificate provider instance configured");
            return None;
        };
        if !ctx.bootstrap.has_certificate_provider(&provider.instance_name) {
            errors.add(format!(
                "certificate provider instance name '{}' not declared in bootstrap",
                provider.instance_name
            ));
            return None;
        }
        Some(TlsContextConfig {
            ca_certificate_provider_instance: provider.instance_name.clone(),
            ca_certificate_name: provider.certificate_name.clone(),
        })
    })
}

fn override_host_statuses(proto: &Cluster) -> Vec<HealthStatus> {
    let statuses = proto
        .common_lb_config
        .as_ref()
        .and_then(|config| config.override_host_status.as_ref());
    match statuses {
        // Unset means the default of UNKNOWN + HEALTHY.
        None => vec![HealthStatus::Unknown, HealthStatus::Healthy],
        Some(set) => {
            let mut out = Vec::new();
            for status in &set.statuses {
                if let Some(status) = HealthStatus::from_proto(*status) {
                    if !out.contains(&status) {
                        out.push(status);
                    }
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Bootstrap;
    use crate::xds::validation::XdsFeatures;
    use envoy_types::pb::envoy::config::cluster::v3::{
        circuit_breakers, CircuitBreakers, LoadBalancingPolicy,
    };
    use envoy_types::pb::envoy::config::core::v3::{
        Address, HealthStatusSet, SocketAddress, TypedExtensionConfig,
    };
    use envoy_types::pb::envoy::config::endpoint::v3::{
        lb_endpoint::HostIdentifier, Endpoint, LbEndpoint, LocalityLbEndpoints,
    };
    use envoy_types::pb::envoy::extensions::load_balancing_policies::round_robin::v3::RoundRobin;
    use envoy_types::pb::google::protobuf::{Any as ProtoAny, UInt32Value, UInt64Value};

    fn test_bootstrap() -> Bootstrap {
        Bootstrap::from_json(
            r#"{
                "xds_servers": [{"server_uri": "test:1"}],
                "certificate_providers": {
                    "google_cloud_private_spiffe": {"plugin_name": "file_watcher"}
                }
            }"#,
        )
        .unwrap()
    }

    fn decode(proto: Cluster) -> Result<ClusterResource, ValidationErrors> {
        decode_with_features(proto, XdsFeatures::default())
    }

    fn decode_with_features(
        proto: Cluster,
        features: XdsFeatures,
    ) -> Result<ClusterResource, ValidationErrors> {
        let bootstrap = test_bootstrap();
        let ctx = DecodeContext { bootstrap: &bootstrap, features };
        ClusterResource::validate(&ctx, proto)
    }

    fn eds_cluster(name: &str, service_name: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::Eds as i32,
            )),
            eds_cluster_config: Some(cluster::EdsClusterConfig {
                eds_config: Some(envoy_types::pb::envoy::config::core::v3::ConfigSource {
                    config_source_specifier: Some(ConfigSourceSpecifier::Ads(
                        envoy_types::pb::envoy::config::core::v3::AggregatedConfigSource::default(),
                    )),
                    ..Default::default()
                }),
                service_name: service_name.to_string(),
            }),
            ..Default::default()
        }
    }

    fn logical_dns_assignment(host: &str, port: u32) -> ClusterLoadAssignment {
        ClusterLoadAssignment {
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                        address: Some(Address {
                            address: Some(address::Address::SocketAddress(SocketAddress {
                                address: host.to_string(),
                                port_specifier: Some(socket_address::PortSpecifier::PortValue(
                                    port,
                                )),
                                ..Default::default()
                            })),
                        }),
                        ..Default::default()
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn eds_cluster_defaults() {
        let resource = decode(eds_cluster("backend", "")).unwrap();
        assert_eq!(resource.kind, ClusterKind::Eds { eds_service_name: "backend".to_string() });
        assert_eq!(resource.max_concurrent_requests, 1024);
        assert_eq!(
            resource.lb_policy_config,
            json!({"wrr_locality": {"child_policy": {"round_robin": {}}}})
        );
        assert!(resource.override_host_statuses.is_empty());
    }

    #[test]
    fn eds_service_name_overrides_cluster_name() {
        let resource = decode(eds_cluster("backend", "svc")).unwrap();
        assert_eq!(resource.kind, ClusterKind::Eds { eds_service_name: "svc".to_string() });
    }

    #[test]
    fn xdstp_cluster_requires_eds_service_name() {
        let name = "xdstp://auth/envoy.config.cluster.v3.Cluster/c";
        let err = decode(eds_cluster(name, "")).unwrap_err();
        assert!(err.to_string().contains("xdstp"));
        assert!(decode(eds_cluster(name, "svc")).is_ok());
    }

    #[test]
    fn missing_discovery_type_fails() {
        let err = decode(Cluster { name: "c".into(), ..Default::default() }).unwrap_err();
        assert!(err.to_string().contains("DiscoveryType"));
    }

    #[test]
    fn static_discovery_type_fails() {
        let cluster = Cluster {
            name: "c".into(),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::Static as i32,
            )),
            ..Default::default()
        };
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("unknown discovery type"));
    }

    #[test]
    fn logical_dns_cluster() {
        let cluster = Cluster {
            name: "dns".into(),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::LogicalDns as i32,
            )),
            load_assignment: Some(logical_dns_assignment("server.example.com", 443)),
            ..Default::default()
        };
        let resource = decode(cluster).unwrap();
        assert_eq!(
            resource.kind,
            ClusterKind::LogicalDns { hostname: "server.example.com:443".to_string() }
        );
    }

    #[test]
    fn logical_dns_requires_exactly_one_endpoint() {
        let mut assignment = logical_dns_assignment("server.example.com", 443);
        assignment.endpoints.push(assignment.endpoints[0].clone());
        let cluster = Cluster {
            name: "dns".into(),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::LogicalDns as i32,
            )),
            load_assignment: Some(assignment),
            ..Default::default()
        };
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("exactly one locality"));
    }

    #[test]
    fn logical_dns_rejects_custom_resolver() {
        let mut assignment = logical_dns_assignment("server.example.com", 443);
        if let Some(HostIdentifier::Endpoint(endpoint)) =
            assignment.endpoints[0].lb_endpoints[0].host_identifier.as_mut()
        {
            if let Some(address::Address::SocketAddress(socket_address)) =
                endpoint.address.as_mut().and_then(|a| a.address.as_mut())
            {
                socket_address.resolver_name = "custom".to_string();
            }
        }
        let cluster = Cluster {
            name: "dns".into(),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::LogicalDns as i32,
            )),
            load_assignment: Some(assignment),
            ..Default::default()
        };
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("custom resolver"));
    }

    #[test]
    fn aggregate_cluster() {
        let config = AggregateProto { clusters: vec!["a".into(), "b".into()] };
        let cluster = Cluster {
            name: "agg".into(),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::ClusterType(
                cluster::CustomClusterType {
                    name: AGGREGATE_CLUSTER_TYPE_NAME.to_string(),
                    typed_config: Some(ProtoAny {
                        type_url: format!("type.googleapis.com/{}", AGGREGATE_CLUSTER_CONFIG_TYPE),
                        value: config.encode_to_vec(),
                    }),
                },
            )),
            ..Default::default()
        };
        let resource = decode(cluster).unwrap();
        assert_eq!(
            resource.kind,
            ClusterKind::Aggregate {
                prioritized_cluster_names: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn aggregate_cluster_requires_children() {
        let config = AggregateProto { clusters: vec![] };
        let cluster = Cluster {
            name: "agg".into(),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::ClusterType(
                cluster::CustomClusterType {
                    name: AGGREGATE_CLUSTER_TYPE_NAME.to_string(),
                    typed_config: Some(ProtoAny {
                        type_url: format!("type.googleapis.com/{}", AGGREGATE_CLUSTER_CONFIG_TYPE),
                        value: config.encode_to_vec(),
                    }),
                },
            )),
            ..Default::default()
        };
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("non-empty"));
    }

    #[test]
    fn legacy_ring_hash_policy() {
        let mut cluster = eds_cluster("c", "");
        cluster.lb_policy = cluster::LbPolicy::RingHash as i32;
        cluster.lb_config = Some(cluster::LbConfig::RingHashLbConfig(cluster::RingHashLbConfig {
            minimum_ring_size: Some(UInt64Value { value: 16 }),
            maximum_ring_size: Some(UInt64Value { value: 1024 }),
            hash_function: cluster::ring_hash_lb_config::HashFunction::XxHash as i32,
        }));
        let resource = decode(cluster).unwrap();
        assert_eq!(
            resource.lb_policy_config,
            json!({"ring_hash": {"min_ring_size": 16, "max_ring_size": 1024}})
        );
    }

    #[test]
    fn ring_hash_bounds_are_checked() {
        let mut cluster = eds_cluster("c", "");
        cluster.lb_policy = cluster::LbPolicy::RingHash as i32;
        cluster.lb_config = Some(cluster::LbConfig::RingHashLbConfig(cluster::RingHashLbConfig {
            minimum_ring_size: Some(UInt64Value { value: 2048 }),
            maximum_ring_size: Some(UInt64Value { value: 1024 }),
            hash_function: 0,
        }));
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("cannot be greater than"));

        let mut cluster = eds_cluster("c", "");
        cluster.lb_policy = cluster::LbPolicy::RingHash as i32;
        cluster.lb_config = Some(cluster::LbConfig::RingHashLbConfig(cluster::RingHashLbConfig {
            minimum_ring_size: Some(UInt64Value { value: 0 }),
            maximum_ring_size: None,
            hash_function: 0,
        }));
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("1 to 8388608"));
    }

    #[test]
    fn legacy_ring_hash_rejects_murmur() {
        let mut cluster = eds_cluster("c", "");
        cluster.lb_policy = cluster::LbPolicy::RingHash as i32;
        cluster.lb_config = Some(cluster::LbConfig::RingHashLbConfig(cluster::RingHashLbConfig {
            minimum_ring_size: None,
            maximum_ring_size: None,
            hash_function: cluster::ring_hash_lb_config::HashFunction::MurmurHash2 as i32,
        }));
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("invalid hash function"));
    }

    #[test]
    fn typed_lb_policy_takes_precedence() {
        let mut cluster = eds_cluster("c", "");
        cluster.lb_policy = cluster::LbPolicy::RingHash as i32;
        cluster.load_balancing_policy = Some(LoadBalancingPolicy {
            policies: vec![
                envoy_types::pb::envoy::config::cluster::v3::load_balancing_policy::Policy {
                    typed_extension_config: Some(TypedExtensionConfig {
                        name: "rr".to_string(),
                        typed_config: Some(ProtoAny {
                            type_url: format!("type.googleapis.com/{}", ROUND_ROBIN_POLICY_TYPE),
                            value: RoundRobin::default().encode_to_vec(),
                        }),
                    }),
                },
            ],
        });
        let resource = decode(cluster).unwrap();
        assert_eq!(resource.lb_policy_config, json!({"round_robin": {}}));
    }

    #[test]
    fn unsupported_typed_policies_are_skipped() {
        let mut cluster = eds_cluster("c", "");
        cluster.load_balancing_policy = Some(LoadBalancingPolicy {
            policies: vec![
                envoy_types::pb::envoy::config::cluster::v3::load_balancing_policy::Policy {
                    typed_extension_config: Some(TypedExtensionConfig {
                        name: "unknown".to_string(),
                        typed_config: Some(ProtoAny {
                            type_url: "type.googleapis.com/unknown.Policy".to_string(),
                            value: Vec::new(),
                        }),
                    }),
                },
                envoy_types::pb::envoy::config::cluster::v3::load_balancing_policy::Policy {
                    typed_extension_config: Some(TypedExtensionConfig {
                        name: "rr".to_string(),
                        typed_config: Some(ProtoAny {
                            type_url: format!("type.googleapis.com/{}", ROUND_ROBIN_POLICY_TYPE),
                            value: RoundRobin::default().encode_to_vec(),
                        }),
                    }),
                },
            ],
        });
        let resource = decode(cluster).unwrap();
        assert_eq!(resource.lb_policy_config, json!({"round_robin": {}}));
    }

    #[test]
    fn max_concurrent_requests_from_default_priority() {
        let mut cluster = eds_cluster("c", "");
        cluster.circuit_breakers = Some(CircuitBreakers {
            thresholds: vec![
                circuit_breakers::Thresholds {
                    priority: RoutingPriority::High as i32,
                    max_requests: Some(UInt32Value { value: 10 }),
                    ..Default::default()
                },
                circuit_breakers::Thresholds {
                    priority: RoutingPriority::Default as i32,
                    max_requests: Some(UInt32Value { value: 77 }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        let resource = decode(cluster).unwrap();
        assert_eq!(resource.max_concurrent_requests, 77);
    }

    #[test]
    fn outlier_detection_bounds() {
        let mut cluster = eds_cluster("c", "");
        cluster.outlier_detection = Some(ProtoOutlierDetection {
            max_ejection_percent: Some(UInt32Value { value: 150 }),
            ..Default::default()
        });
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("<= 100"));

        let mut cluster = eds_cluster("c", "");
        cluster.outlier_detection = Some(ProtoOutlierDetection {
            interval: Some(envoy_types::pb::google::protobuf::Duration {
                seconds: -1,
                nanos: 0,
            }),
            ..Default::default()
        });
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("interval"));
    }

    #[test]
    fn outlier_detection_defaults() {
        let mut cluster = eds_cluster("c", "");
        cluster.outlier_detection = Some(ProtoOutlierDetection::default());
        let resource = decode(cluster).unwrap();
        let od = resource.outlier_detection.unwrap();
        assert_eq!(od.interval, Duration::from_secs(10));
        assert_eq!(od.base_ejection_time, Duration::from_secs(30));
        assert_eq!(od.max_ejection_time, Duration::from_secs(300));
        // enforcing_success_rate defaults to 100, so SR ejection is on.
        assert!(od.success_rate_ejection.is_some());
        // enforcing_failure_percentage defaults to 0, so FP ejection is off.
        assert!(od.failure_percentage_ejection.is_none());
    }

    #[test]
    fn tls_context_requires_known_provider() {
        fn tls_cluster(instance_name: &str) -> Cluster {
            use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
                CertificateProviderPluginInstance, CertificateValidationContext, CommonTlsContext,
            };
            let tls = UpstreamTlsContext {
                common_tls_context: Some(CommonTlsContext {
                    validation_context_type: Some(ValidationContextType::ValidationContext(
                        CertificateValidationContext {
                            ca_certificate_provider_instance: Some(
                                CertificateProviderPluginInstance {
                                    instance_name: instance_name.to_string(),
                                    certificate_name: "root".to_string(),
                                },
                            ),
                            ..Default::default()
                        },
                    )),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let mut cluster = eds_cluster("c", "");
            cluster.transport_socket = Some(TransportSocket {
                name: TLS_TRANSPORT_SOCKET_NAME.to_string(),
                config_type: Some(
                    envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType::TypedConfig(
                        ProtoAny {
                            type_url: format!("type.googleapis.com/{}", UPSTREAM_TLS_CONTEXT_TYPE),
                            value: tls.encode_to_vec(),
                        },
                    ),
                ),
            });
            cluster
        }

        let resource = decode(tls_cluster("google_cloud_private_spiffe")).unwrap();
        let tls = resource.tls_context.unwrap();
        assert_eq!(tls.ca_certificate_provider_instance, "google_cloud_private_spiffe");
        assert_eq!(tls.ca_certificate_name, "root");

        let err = decode(tls_cluster("unknown_provider")).unwrap_err();
        assert!(err.to_string().contains("not declared in bootstrap"));
    }

    #[test]
    fn unknown_transport_socket_fails() {
        let mut cluster = eds_cluster("c", "");
        cluster.transport_socket = Some(TransportSocket {
            name: "envoy.transport_sockets.tap".to_string(),
            config_type: None,
        });
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("unrecognized transport socket"));
    }

    #[test]
    fn override_host_statuses_gated_by_feature() {
        let mut cluster = eds_cluster("c", "");
        cluster.common_lb_config = Some(cluster::CommonLbConfig {
            override_host_status: Some(HealthStatusSet {
                statuses: vec![
                    envoy_types::pb::envoy::config::core::v3::HealthStatus::Healthy as i32,
                    envoy_types::pb::envoy::config::core::v3::HealthStatus::Draining as i32,
                ],
            }),
            ..Default::default()
        });

        let resource = decode(cluster.clone()).unwrap();
        assert!(resource.override_host_statuses.is_empty());

        let features = XdsFeatures { override_host_status: true, ..Default::default() };
        let resource = decode_with_features(cluster, features).unwrap();
        assert_eq!(
            resource.override_host_statuses,
            vec![HealthStatus::Healthy, HealthStatus::Draining]
        );
    }

    #[test]
    fn lrs_server_must_be_self() {
        let mut cluster = eds_cluster("c", "");
        cluster.lrs_server = Some(envoy_types::pb::envoy::config::core::v3::ConfigSource {
            config_source_specifier: Some(ConfigSourceSpecifier::Self_(
                envoy_types::pb::envoy::config::core::v3::SelfConfigSource::default(),
            )),
            ..Default::default()
        });
        let resource = decode(cluster).unwrap();
        assert_eq!(resource.lrs_load_reporting_server, Some(LrsServer::SelfServer));

        let mut cluster = eds_cluster("c", "");
        cluster.lrs_server = Some(envoy_types::pb::envoy::config::core::v3::ConfigSource {
            config_source_specifier: Some(ConfigSourceSpecifier::Ads(
                envoy_types::pb::envoy::config::core::v3::AggregatedConfigSource::default(),
            )),
            ..Default::default()
        });
        let err = decode(cluster).unwrap_err();
        assert!(err.to_string().contains("not self"));
    }
}
