//! HTTP filter registry.
//!
//! The registry identifies filters by their config type URL; the core does
//! not interpret filter payloads beyond that. The set of known filters is
//! fixed at process start; per-client construction only selects which
//! entries are visible (RBAC is feature-gated). Lookups are lock-free.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::validation::XdsFeatures;

pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

pub const ROUTER_FILTER_TYPE: &str = "envoy.extensions.filters.http.router.v3.Router";
pub const FAULT_FILTER_TYPE: &str = "envoy.extensions.filters.http.fault.v3.HTTPFault";
pub const RBAC_FILTER_TYPE: &str = "envoy.extensions.filters.http.rbac.v3.RBAC";
pub const RBAC_PER_ROUTE_FILTER_TYPE: &str = "envoy.extensions.filters.http.rbac.v3.RBACPerRoute";

/// Strip the `type.googleapis.com/` prefix from an `Any` type URL.
pub fn proto_type_path(type_url: &str) -> &str {
    type_url.strip_prefix(TYPE_URL_PREFIX).unwrap_or(type_url)
}

/// Static description of a supported HTTP filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpFilterDescriptor {
    /// Proto path of the top-level filter config.
    pub config_type: &'static str,
    /// Proto path of the per-route override config, if the filter has one.
    pub override_type: Option<&'static str>,
    /// Terminal filters must be last in the chain (the router).
    pub is_terminal: bool,
}

static KNOWN_FILTERS: Lazy<Vec<HttpFilterDescriptor>> = Lazy::new(|| {
    vec![
        HttpFilterDescriptor {
            config_type: ROUTER_FILTER_TYPE,
            override_type: None,
            is_terminal: true,
        },
        HttpFilterDescriptor {
            config_type: FAULT_FILTER_TYPE,
            override_type: Some(FAULT_FILTER_TYPE),
            is_terminal: false,
        },
        HttpFilterDescriptor {
            config_type: RBAC_FILTER_TYPE,
            override_type: Some(RBAC_PER_ROUTE_FILTER_TYPE),
            is_terminal: false,
        },
    ]
});

/// Per-client view over the known filters.
#[derive(Debug, Clone)]
pub struct HttpFilterRegistry {
    by_config_type: HashMap<&'static str, &'static HttpFilterDescriptor>,
    by_override_type: HashMap<&'static str, &'static HttpFilterDescriptor>,
}

impl HttpFilterRegistry {
    pub fn new(features: &XdsFeatures) -> Self {
        let mut by_config_type = HashMap::new();
        let mut by_override_type = HashMap::new();
        for descriptor in KNOWN_FILTERS.iter() {
            if descriptor.config_type == RBAC_FILTER_TYPE && !features.rbac {
                continue;
            }
            by_config_type.insert(descriptor.config_type, descriptor);
            if let Some(override_type) = descriptor.override_type {
                by_override_type.insert(override_type, descriptor);
            }
        }
        Self { by_config_type, by_override_type }
    }

    /// Look up a filter by the proto path of its top-level config.
    pub fn for_config_type(&self, type_path: &str) -> Option<&'static HttpFilterDescriptor> {
        self.by_config_type.get(type_path).copied()
    }

    /// Look up a filter by the proto path of a per-route override config.
    pub fn for_override_type(&self, type_path: &str) -> Option<&'static HttpFilterDescriptor> {
        self.by_override_type.get(type_path).copied()
    }
}
