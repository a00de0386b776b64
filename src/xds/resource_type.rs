//! The closed set of resource types the client understands, and the
//! type-erased operations the cache and transport use to handle them
//! uniformly.
//!
//! Each type knows its wire type URL, whether a state-of-the-world
//! response enumerates every live resource of the type (Listener and
//! Cluster), how to extract a resource's name from its payload, and how to
//! validate a decoded payload into the in-memory representation.

use std::any::Any as StdAny;
use std::sync::Arc;

use envoy_types::pb::google::protobuf::Any as ProtoAny;
use once_cell::sync::Lazy;
use prost::Message;

use super::filters::{proto_type_path, TYPE_URL_PREFIX};
use super::validation::{DecodeContext, ValidationErrors};

/// A validated resource with its concrete type erased, shared by the cache
/// and every watcher.
pub type ErasedResource = Arc<dyn StdAny + Send + Sync>;

/// One of the four xDS resource types.
pub trait ResourceType: Sized + 'static {
    /// Proto path, e.g. `envoy.config.listener.v3.Listener`.
    const TYPE_PATH: &'static str;

    /// Whether a SotW response enumerates all live resources of this type,
    /// making omission mean "does not exist".
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool;

    /// The wire message.
    type Proto: Message + Default;

    /// The validated in-memory representation.
    type Resource: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static;

    /// Extract the resource's name from its payload.
    fn proto_resource_name(proto: &Self::Proto) -> String;

    /// Validate a decoded payload. Pure; accumulates every violation.
    fn validate(
        ctx: &DecodeContext<'_>,
        proto: Self::Proto,
    ) -> Result<Self::Resource, ValidationErrors>;

    /// Full wire type URL (`type.googleapis.com/` + path).
    fn type_url() -> String {
        format!("{}{}", TYPE_URL_PREFIX, Self::TYPE_PATH)
    }
}

/// Outcome of decoding a single resource out of a response.
pub(crate) struct DecodedResource {
    /// Resource name; `None` when the payload was undecodable, in which
    /// case the whole response is still processed but this entry only
    /// contributes to the NACK detail.
    pub name: Option<String>,
    /// Raw payload bytes, retained for diagnostics on accepted resources.
    pub serialized: Vec<u8>,
    pub parsed: Result<ErasedResource, String>,
}

/// Type-erased per-type operations.
pub(crate) struct ResourceTypeOps {
    pub type_path: &'static str,
    pub type_url: &'static str,
    pub all_resources_required_in_sotw: bool,
    pub decode: fn(&DecodeContext<'_>, &ProtoAny) -> DecodedResource,
    pub resources_equal: fn(&ErasedResource, &ErasedResource) -> bool,
}

fn decode_erased<T: ResourceType>(ctx: &DecodeContext<'_>, any: &ProtoAny) -> DecodedResource {
    let path = proto_type_path(&any.type_url);
    if path != T::TYPE_PATH {
        return DecodedResource {
            name: None,
            serialized: any.value.clone(),
            parsed: Err(format!(
                "resource has type '{}', expected '{}'",
                path,
                T::TYPE_PATH
            )),
        };
    }
    let proto = match T::Proto::decode(&any.value[..]) {
        Ok(proto) => proto,
        Err(e) => {
            return DecodedResource {
                name: None,
                serialized: any.value.clone(),
                parsed: Err(format!("protobuf decode failed: {}", e)),
            }
        }
    };
    let name = T::proto_resource_name(&proto);
    let parsed = match T::validate(ctx, proto) {
        Ok(resource) => Ok(Arc::new(resource) as ErasedResource),
        Err(errors) => Err(errors.to_string()),
    };
    DecodedResource {
        name: if name.is_empty() { None } else { Some(name) },
        serialized: any.value.clone(),
        parsed,
    }
}

fn resources_equal_erased<T: ResourceType>(a: &ErasedResource, b: &ErasedResource) -> bool {
    match (a.downcast_ref::<T::Resource>(), b.downcast_ref::<T::Resource>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn ops_entry<T: ResourceType>(type_url: &'static str) -> ResourceTypeOps {
    ResourceTypeOps {
        type_path: T::TYPE_PATH,
        type_url,
        all_resources_required_in_sotw: T::ALL_RESOURCES_REQUIRED_IN_SOTW,
        decode: decode_erased::<T>,
        resources_equal: resources_equal_erased::<T>,
    }
}

pub const LISTENER_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_CONFIG_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

static REGISTRY: Lazy<Vec<ResourceTypeOps>> = Lazy::new(|| {
    vec![
        ops_entry::<super::listener::ListenerResource>(LISTENER_TYPE_URL),
        ops_entry::<super::route::RouteConfigResource>(ROUTE_CONFIG_TYPE_URL),
        ops_entry::<super::cluster::ClusterResource>(CLUSTER_TYPE_URL),
        ops_entry::<super::endpoint::EndpointResource>(ENDPOINT_TYPE_URL),
    ]
});

/// All four resource types, in dependency order.
pub(crate) fn all_types() -> &'static [ResourceTypeOps] {
    &REGISTRY
}

/// Look up a type by its full wire type URL.
pub(crate) fn ops_for_type_url(type_url: &str) -> Option<&'static ResourceTypeOps> {
    REGISTRY.iter().find(|ops| ops.type_url == type_url)
}

/// Look up a type by its proto path.
pub(crate) fn ops_for_type_path(type_path: &str) -> Option<&'static ResourceTypeOps> {
    REGISTRY.iter().find(|ops| ops.type_path == type_path)
}

fn inert_decode(_ctx: &DecodeContext<'_>, any: &ProtoAny) -> DecodedResource {
    DecodedResource {
        name: None,
        serialized: any.value.clone(),
        parsed: Err("inert resource type".to_string()),
    }
}

fn inert_equal(_a: &ErasedResource, _b: &ErasedResource) -> bool {
    false
}

/// Placeholder ops for watch handles that failed before registration.
pub(crate) static INERT_OPS: ResourceTypeOps = ResourceTypeOps {
    type_path: "",
    type_url: "",
    all_resources_required_in_sotw: false,
    decode: inert_decode,
    resources_equal: inert_equal,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_the_four_types() {
        let types: Vec<_> = all_types().iter().map(|ops| ops.type_path).collect();
        assert_eq!(
            types,
            vec![
                "envoy.config.listener.v3.Listener",
                "envoy.config.route.v3.RouteConfiguration",
                "envoy.config.cluster.v3.Cluster",
                "envoy.config.endpoint.v3.ClusterLoadAssignment",
            ]
        );
    }

    #[test]
    fn sotw_deletion_semantics_only_for_listener_and_cluster() {
        assert!(ops_for_type_url(LISTENER_TYPE_URL).unwrap().all_resources_required_in_sotw);
        assert!(ops_for_type_url(CLUSTER_TYPE_URL).unwrap().all_resources_required_in_sotw);
        assert!(!ops_for_type_url(ROUTE_CONFIG_TYPE_URL).unwrap().all_resources_required_in_sotw);
        assert!(!ops_for_type_url(ENDPOINT_TYPE_URL).unwrap().all_resources_required_in_sotw);
        assert!(ops_for_type_url("type.googleapis.com/other.Type").is_none());
    }
}
