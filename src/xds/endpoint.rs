//! Endpoint (ClusterLoadAssignment) resource validation using envoy-types.
//!
//! The validated form is a dense vector indexed by priority; each priority
//! maps locality names to localities with their weights and endpoint
//! addresses. Drop rules ride along at the top level.

use std::collections::{BTreeMap, HashSet};

use envoy_types::pb::envoy::config::core::v3::{address, Address, HealthStatus as ProtoHealthStatus};
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::r#type::v3::fractional_percent::DenominatorType;

use super::resource_type::ResourceType;
use super::validation::{DecodeContext, ValidationErrors};

/// Endpoint health as retained by the client. Statuses outside this set
/// cause the endpoint to be dropped during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Draining,
}

impl HealthStatus {
    pub fn from_proto(status: i32) -> Option<Self> {
        match ProtoHealthStatus::try_from(status) {
            Ok(ProtoHealthStatus::Unknown) => Some(HealthStatus::Unknown),
            Ok(ProtoHealthStatus::Healthy) => Some(HealthStatus::Healthy),
            Ok(ProtoHealthStatus::Draining) => Some(HealthStatus::Draining),
            _ => None,
        }
    }
}

/// Locality name, compared lexicographically as (region, zone, sub_zone).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalityName {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

impl std::fmt::Display for LocalityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{region=\"{}\", zone=\"{}\", sub_zone=\"{}\"}}",
            self.region, self.zone, self.sub_zone
        )
    }
}

/// Validated Endpoint resource.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EndpointResource {
    /// Dense by priority: `priorities[0]` is the highest priority.
    pub priorities: Vec<Priority>,
    pub drop_config: DropConfig,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Priority {
    pub localities: BTreeMap<LocalityName, Locality>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Locality {
    pub name: LocalityName,
    pub lb_weight: u32,
    pub endpoints: Vec<WeightedEndpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedEndpoint {
    /// gRPC-style URI, e.g. `ipv4:127.0.0.1:443`.
    pub address: String,
    pub weight: u32,
    pub health_status: HealthStatus,
}

/// Ordered drop rules applied before load balancing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DropConfig {
    pub categories: Vec<DropCategory>,
    /// True when some category drops everything.
    pub drop_all: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropCategory {
    pub name: String,
    pub parts_per_million: u32,
}

impl ResourceType for EndpointResource {
    const TYPE_PATH: &'static str = "envoy.config.endpoint.v3.ClusterLoadAssignment";
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = false;

    type Proto = ClusterLoadAssignment;
    type Resource = EndpointResource;

    fn proto_resource_name(proto: &ClusterLoadAssignment) -> String {
        proto.cluster_name.clone()
    }

    fn validate(
        ctx: &DecodeContext<'_>,
        proto: ClusterLoadAssignment,
    ) -> Result<EndpointResource, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let mut priorities: BTreeMap<u32, Priority> = BTreeMap::new();
        let mut seen_addresses: HashSet<String> = HashSet::new();

        errors.scoped("endpoints", |errors| {
            for (i, locality_endpoints) in proto.endpoints.into_iter().enumerate() {
                errors.scoped(format!("[{}]", i), |errors| {
                    validate_locality(
                        ctx,
                        locality_endpoints,
                        &mut priorities,
                        &mut seen_addresses,
                        errors,
                    );
                });
            }
        });

        // Priorities may arrive in any order but must be dense.
        if let Some(max_priority) = priorities.keys().max().copied() {
            for priority in 0..=max_priority {
                if !priorities.contains_key(&priority) {
                    errors.add_at(
                        "endpoints",
                        format!("priority {} empty but priority {} has entries", priority, max_priority),
                    );
                }
            }
        }

        let drop_config = errors.scoped("policy.drop_overloads", |errors| {
            validate_drop_overloads(proto.policy.as_ref(), errors)
        });

        let resource = EndpointResource {
            priorities: priorities.into_values().collect(),
            drop_config,
        };
        errors.into_result(resource)
    }
}

fn validate_locality(
    ctx: &DecodeContext<'_>,
    locality_endpoints: LocalityLbEndpoints,
    priorities: &mut BTreeMap<u32, Priority>,
    seen_addresses: &mut HashSet<String>,
    errors: &mut ValidationErrors,
) {
    let lb_weight = locality_endpoints
        .load_balancing_weight
        .as_ref()
        .map(|w| w.value)
        .unwrap_or(0);
    if lb_weight == 0 {
        // Zero-weight localities are dropped, not errors; the priority
        // emptiness check below catches pathological inputs.
        return;
    }

    let name = match locality_endpoints.locality {
        Some(locality) => LocalityName {
            region: locality.region,
            zone: locality.zone,
            sub_zone: locality.sub_zone,
        },
        None => {
            errors.add_at("locality", "field not present");
            return;
        }
    };

    let mut endpoints = Vec::with_capacity(locality_endpoints.lb_endpoints.len());
    errors.scoped("lb_endpoints", |errors| {
        for (i, lb_endpoint) in locality_endpoints.lb_endpoints.into_iter().enumerate() {
            errors.scoped(format!("[{}]", i), |errors| {
                if let Some(endpoint) =
                    validate_endpoint(ctx, lb_endpoint, seen_addresses, errors)
                {
                    endpoints.push(endpoint);
                }
            });
        }
    });

    let priority = locality_endpoints.priority;
    let entry = priorities.entry(priority).or_default();
    if entry.localities.contains_key(&name) {
        errors.add(format!("duplicate locality {} found in priority {}", name, priority));
        return;
    }
    let weight_sum: u64 = entry
        .localities
        .values()
        .map(|l| u64::from(l.lb_weight))
        .sum::<u64>()
        + u64::from(lb_weight);
    if u32::try_from(weight_sum).is_err() {
        errors.add(format!("sum of locality weights for priority {} exceeds uint32 max", priority));
        return;
    }
    entry.localities.insert(name.clone(), Locality { name, lb_weight, endpoints });
}

fn validate_endpoint(
    ctx: &DecodeContext<'_>,
    lb_endpoint: LbEndpoint,
    seen_addresses: &mut HashSet<String>,
    errors: &mut ValidationErrors,
) -> Option<WeightedEndpoint> {
    let health_status = match HealthStatus::from_proto(lb_endpoint.health_status) {
        Some(HealthStatus::Draining) if ctx.features.override_host_status => {
            HealthStatus::Draining
        }
        Some(HealthStatus::Draining) | None => return None,
        Some(status) => status,
    };

    let weight = match lb_endpoint.load_balancing_weight.as_ref() {
        Some(weight) if weight.value == 0 => {
            errors.add_at("load_balancing_weight", "must be greater than 0");
            return None;
        }
        Some(weight) => weight.value,
        None => 1,
    };

    let endpoint = match lb_endpoint.host_identifier {
        Some(HostIdentifier::Endpoint(endpoint)) => endpoint,
        _ => {
            errors.add_at("endpoint", "field not present");
            return None;
        }
    };
    let Some(address) = endpoint_uri(endpoint.address.as_ref()) else {
        errors.add_at("endpoint.address", "expected SocketAddress with a port value");
        return None;
    };
    if !seen_addresses.insert(address.clone()) {
        errors.add(format!("duplicate endpoint address \"{}\"", address));
        return None;
    }
    Some(WeightedEndpoint { address, weight, health_status })
}

fn validate_drop_overloads(
    policy: Option<&envoy_types::pb::envoy::config::endpoint::v3::cluster_load_assignment::Policy>,
    errors: &mut ValidationErrors,
) -> DropConfig {
    let mut config = DropConfig::default();
    let Some(policy) = policy else {
        return config;
    };
    for (i, overload) in policy.drop_overloads.iter().enumerate() {
        errors.scoped(format!("[{}]", i), |errors| {
            if overload.category.is_empty() {
                errors.add_at("category", "empty drop category name");
                return;
            }
            let Some(percentage) = overload.drop_percentage.as_ref() else {
                errors.add_at("drop_percentage", "field not present");
                return;
            };
            let multiplier = match DenominatorType::try_from(percentage.denominator) {
                Ok(DenominatorType::Hundred) => 10_000,
                Ok(DenominatorType::TenThousand) => 100,
                Ok(DenominatorType::Million) => 1,
                Err(_) => {
                    errors.add_at("drop_percentage.denominator", "unknown denominator type");
                    return;
                }
            };
            let parts_per_million =
                percentage.numerator.saturating_mul(multiplier).min(1_000_000);
            if parts_per_million == 1_000_000 {
                config.drop_all = true;
            }
            config.categories.push(DropCategory {
                name: overload.category.clone(),
                parts_per_million,
            });
        });
    }
    config
}

/// Render an endpoint address as a gRPC-style URI (`ipv4:`/`ipv6:` prefix).
fn endpoint_uri(address: Option<&Address>) -> Option<String> {
    let socket_address = match address?.address.as_ref()? {
        address::Address::SocketAddress(socket_address) => socket_address,
        _ => return None,
    };
    let port = match socket_address.port_specifier.as_ref()? {
        PortSpecifier::PortValue(port) => *port,
        _ => return None,
    };
    if socket_address.address.is_empty() {
        return None;
    }
    if socket_address.address.contains(':') {
        Some(format!("ipv6:[{}]:{}", socket_address.address, port))
    } else {
        Some(format!("ipv4:{}:{}", socket_address.address, port))
    }
}

/// Plain `host:port` rendering for listener addresses.
pub(crate) fn socket_address_string(address: Option<&Address>) -> Option<String> {
    let socket_address = match address?.address.as_ref()? {
        address::Address::SocketAddress(socket_address) => socket_address,
        _ => return None,
    };
    let port = match socket_address.port_specifier.as_ref()? {
        PortSpecifier::PortValue(port) => *port,
        _ => return None,
    };
    Some(format!("{}:{}", socket_address.address, port))
}
