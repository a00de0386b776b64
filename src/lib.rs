//! # Meshwire
//!
//! Meshwire is an xDS client library for service-mesh data planes and RPC
//! stacks. It discovers listeners, route configurations, clusters, and
//! endpoints from a remote management server over the Envoy v3 discovery
//! protocols, maintains a cache of the latest validated resource
//! snapshots, and delivers typed updates to in-process consumers.
//!
//! ## Architecture
//!
//! ```text
//! consumer → XdsClient.watch → cache/watcher registry → ADS transport
//!                ↑                      ↓                     ↓
//!       XdsDependencyManager      validators          management server
//! ```
//!
//! ## Core Components
//!
//! - **ADS transport**: one long-lived bidi stream per management server,
//!   ACK/NACK version reconciliation, exponential-backoff reconnection
//! - **Resource cache**: authoritative latest values plus watcher fan-out
//! - **Validators**: pure decoders for Listener, RouteConfiguration,
//!   Cluster, and Endpoint resources
//! - **Dependency manager**: composes all four types (plus DNS) into a
//!   single consistent configuration snapshot
//! - **LRS**: periodic load reports built from sharded atomic counters

pub mod config;
pub mod errors;
pub mod observability;
pub mod xds;

// Re-export commonly used types and traits
pub use config::Bootstrap;
pub use errors::{Error, MeshwireError, Result};
pub use xds::{
    ConfigWatcher, ResourceWatcher, XdsClient, XdsClientOptions, XdsConfig, XdsDependencyManager,
};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
