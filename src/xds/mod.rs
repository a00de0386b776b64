//! Envoy xDS client implementation
//!
//! Speaks the v3 discovery protocols against a management server:
//! - ADS (Aggregated Discovery Service) over a single bidi stream
//! - LRS (Load Reporting Service) for periodic usage snapshots
//!
//! The modules layer bottom-up: validators for the four resource types,
//! the resource cache with its watcher registry, the transport channel
//! with ACK/NACK and backoff handling, the client facade, and the
//! dependency manager that folds everything into composite snapshots.

pub mod backoff;
mod cache;
pub mod client;
pub mod cluster;
pub mod dependency;
pub mod endpoint;
pub mod filters;
pub mod listener;
mod lrs;
pub mod matchers;
mod name;
pub mod resource_type;
pub mod route;
mod serializer;
pub mod stats;
mod transport;
pub mod validation;

pub use cache::{CacheEntryStatus, ResourceWatcher};
pub use client::{WatchHandle, XdsClient, XdsClientOptions};
pub use cluster::ClusterResource;
pub use dependency::{
    ClusterChildren, ClusterConfig, ClusterSubscription, ConfigWatcher, DnsResolver, XdsConfig,
    XdsDependencyManager,
};
pub use endpoint::{EndpointResource, HealthStatus, LocalityName};
pub use listener::ListenerResource;
pub use name::XdsResourceName;
pub use resource_type::ResourceType;
pub use route::RouteConfigResource;
pub use stats::{XdsClusterDropStats, XdsClusterLocalityStats};
pub use validation::{ValidationErrors, XdsFeatures};
