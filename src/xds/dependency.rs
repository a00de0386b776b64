//! Dependency manager.
//!
//! Watches the full resource graph for one data-plane authority — Listener
//! → RouteConfiguration → Cluster(s) → Endpoint resource or DNS hostname,
//! with recursive aggregate-cluster expansion — and publishes a single
//! consistent [`XdsConfig`] snapshot once every referenced resource has
//! been obtained or has reached a terminal failure state. Snapshots are
//! value objects published behind an `Arc` and never mutated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{MeshwireError, Result};

use super::cache::ResourceWatcher;
use super::client::{WatchHandle, XdsClient};
use super::cluster::{ClusterKind, ClusterResource};
use super::endpoint::{
    EndpointResource, HealthStatus, Locality, LocalityName, Priority, WeightedEndpoint,
};
use super::listener::{ListenerResource, ListenerRouteSpecifier};
use super::route::{
    find_virtual_host, RouteActionKind, RouteActionVariant, RouteConfigResource, VirtualHost,
};
use super::serializer::WorkSerializer;

const MAX_AGGREGATE_RECURSION_DEPTH: usize = 16;

/// Composite configuration snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct XdsConfig {
    pub listener: Arc<ListenerResource>,
    /// Populated even when the route config was inlined in the listener.
    pub route_config: Arc<RouteConfigResource>,
    /// Index of the selected virtual host within `route_config`.
    pub virtual_host_index: usize,
    /// Every referenced cluster, including aggregate children. A non-OK
    /// entry carries the reason the cluster is unusable.
    pub clusters: BTreeMap<String, std::result::Result<ClusterConfig, String>>,
}

impl XdsConfig {
    pub fn virtual_host(&self) -> &VirtualHost {
        &self.route_config.virtual_hosts[self.virtual_host_index]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub cluster: Arc<ClusterResource>,
    pub children: ClusterChildren,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterChildren {
    /// Leaf (EDS or LOGICAL_DNS): endpoint data, or a resolution note
    /// explaining why there is none.
    Endpoints { endpoints: Option<Arc<EndpointResource>>, resolution_note: String },
    /// Aggregate: the flattened leaf-cluster names, in priority order.
    Aggregate { leaf_clusters: Vec<String> },
}

/// Receives dependency-manager output. Errors and does-not-exist events
/// are only reported at listener / route-config level; per-cluster
/// failures appear as non-OK entries in the snapshot.
pub trait ConfigWatcher: Send + Sync + 'static {
    fn on_update(&self, config: Arc<XdsConfig>);
    fn on_error(&self, context: &str, error: MeshwireError);
    fn on_resource_does_not_exist(&self, context: &str);
}

/// Resolves LOGICAL_DNS hostnames. The default implementation uses
/// tokio's resolver; tests inject their own.
#[async_trait]
pub trait DnsResolver: Send + Sync + 'static {
    /// `host_port` is `hostname:port`.
    async fn resolve(&self, host_port: &str) -> Result<Vec<SocketAddr>>;
}

/// [`DnsResolver`] backed by `tokio::net::lookup_host`.
#[derive(Debug, Default)]
pub struct TokioDnsResolver;

#[async_trait]
impl DnsResolver for TokioDnsResolver {
    async fn resolve(&self, host_port: &str) -> Result<Vec<SocketAddr>> {
        let addresses: Vec<SocketAddr> = tokio::net::lookup_host(host_port)
            .await
            .map_err(|e| {
                MeshwireError::transport(format!("DNS resolution failed for {}: {}", host_port, e))
            })?
            .collect();
        Ok(addresses)
    }
}

/// Pins a cluster into the composite config while alive (used for
/// clusters referenced dynamically, e.g. by RLS). Dropping the handle
/// releases the pin and may cancel the CDS watch.
pub struct ClusterSubscription {
    cluster_name: String,
    manager: Weak<DependencyManagerInner>,
}

impl ClusterSubscription {
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }
}

impl Drop for ClusterSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let name = std::mem::take(&mut self.cluster_name);
        let job = inner.clone();
        inner.serializer.post(move || job.on_subscription_dropped(&name));
    }
}

/// Per-(authority, listener) dependency manager.
pub struct XdsDependencyManager {
    inner: Arc<DependencyManagerInner>,
}

struct DependencyManagerInner {
    client: XdsClient,
    serializer: WorkSerializer,
    /// Data-plane authority used for virtual-host selection.
    data_plane_authority: String,
    listener_name: String,
    watcher: Arc<dyn ConfigWatcher>,
    dns_resolver: Arc<dyn DnsResolver>,
    shutdown: CancellationToken,
    state: Mutex<DependencyState>,
}

#[derive(Default)]
struct DependencyState {
    closed: bool,
    listener_handle: Option<WatchHandle>,
    listener: Option<Arc<ListenerResource>>,
    rds_name: Option<String>,
    rds_handle: Option<WatchHandle>,
    route_config: Option<Arc<RouteConfigResource>>,
    clusters_from_route_config: BTreeSet<String>,
    cluster_watchers: HashMap<String, ClusterWatcherState>,
    endpoint_watchers: HashMap<String, EndpointWatcherState>,
    dns_resolvers: HashMap<String, DnsState>,
    subscriptions: HashMap<String, Weak<ClusterSubscription>>,
    last_config: Option<Arc<XdsConfig>>,
}

#[derive(Default)]
struct ClusterWatcherState {
    handle: Option<WatchHandle>,
    /// `None` until the first event; then the resource or an error string.
    update: Option<std::result::Result<Arc<ClusterResource>, String>>,
}

#[derive(Default)]
struct EndpointWatcherState {
    handle: Option<WatchHandle>,
    endpoints: Option<Arc<EndpointResource>>,
    resolution_note: String,
}

impl EndpointWatcherState {
    fn received(&self) -> bool {
        self.endpoints.is_some() || !self.resolution_note.is_empty()
    }
}

struct DnsState {
    token: CancellationToken,
    endpoints: Option<Arc<EndpointResource>>,
    resolution_note: String,
}

impl DnsState {
    fn received(&self) -> bool {
        self.endpoints.is_some() || !self.resolution_note.is_empty()
    }
}

impl XdsDependencyManager {
    /// Create the manager and immediately start the listener watch.
    pub fn new(
        client: XdsClient,
        data_plane_authority: &str,
        listener_name: &str,
        watcher: Arc<dyn ConfigWatcher>,
    ) -> Self {
        Self::with_dns_resolver(
            client,
            data_plane_authority,
            listener_name,
            watcher,
            Arc::new(TokioDnsResolver),
        )
    }

    pub fn with_dns_resolver(
        client: XdsClient,
        data_plane_authority: &str,
        listener_name: &str,
        watcher: Arc<dyn ConfigWatcher>,
        dns_resolver: Arc<dyn DnsResolver>,
    ) -> Self {
        let inner = Arc::new(DependencyManagerInner {
            client,
            serializer: WorkSerializer::new("xds-dependency-manager"),
            data_plane_authority: data_plane_authority.to_string(),
            listener_name: listener_name.to_string(),
            watcher,
            dns_resolver,
            shutdown: CancellationToken::new(),
            state: Mutex::new(DependencyState::default()),
        });
        info!(
            listener = listener_name,
            authority = data_plane_authority,
            "starting dependency manager"
        );
        let handle = inner.client.watch::<ListenerResource>(
            listener_name,
            Arc::new(ListenerWatcher { manager: Arc::downgrade(&inner) }),
        );
        inner.state.lock().expect("dependency state lock poisoned").listener_handle = Some(handle);
        Self { inner }
    }

    /// Pin a cluster into the config independent of the route config.
    pub fn get_cluster_subscription(&self, cluster_name: &str) -> Arc<ClusterSubscription> {
        let mut state = self.inner.state.lock().expect("dependency state lock poisoned");
        if let Some(existing) = state.subscriptions.get(cluster_name).and_then(Weak::upgrade) {
            return existing;
        }
        let subscription = Arc::new(ClusterSubscription {
            cluster_name: cluster_name.to_string(),
            manager: Arc::downgrade(&self.inner),
        });
        state
            .subscriptions
            .insert(cluster_name.to_string(), Arc::downgrade(&subscription));
        let newly_referenced = !state.clusters_from_route_config.contains(cluster_name);
        drop(state);
        if newly_referenced {
            let inner = self.inner.clone();
            self.inner.serializer.post(move || inner.maybe_report_update());
        }
        subscription
    }

    /// Stop all watches and resolvers. No watcher callbacks fire after
    /// this returns.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for XdsDependencyManager {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl DependencyManagerInner {
    fn close(&self) {
        self.shutdown.cancel();
        self.serializer.close();
        let mut state = self.state.lock().expect("dependency state lock poisoned");
        state.closed = true;
        state.listener_handle.take();
        state.rds_handle.take();
        for (_, watcher) in state.cluster_watchers.drain() {
            drop(watcher.handle);
        }
        for (_, watcher) in state.endpoint_watchers.drain() {
            drop(watcher.handle);
        }
        for (_, dns) in state.dns_resolvers.drain() {
            dns.token.cancel();
        }
    }

    fn on_listener_changed(self: &Arc<Self>, resource: Arc<ListenerResource>) {
        let mut state = self.state.lock().expect("dependency state lock poisoned");
        if state.closed {
            return;
        }
        debug!(listener = %self.listener_name, "received listener update");
        let hcm = match resource.as_ref() {
            ListenerResource::ApiListener(hcm) => hcm.clone(),
            ListenerResource::TcpListener { .. } => {
                drop(state);
                self.watcher.on_error(
                    "listener",
                    MeshwireError::validation("listener is not an API listener"),
                );
                return;
            }
        };
        state.listener = Some(resource);
        match hcm.route_specifier {
            ListenerRouteSpecifier::Rds { name } => {
                if state.rds_name.as_deref() != Some(name.as_str()) {
                    if let Some(old) = state.rds_handle.take() {
                        // The new watch goes out in the same aggregated
                        // request as the unsubscription.
                        old.cancel_for_replacement();
                    }
                    state.route_config = None;
                    state.rds_name = Some(name.clone());
                    let handle = self.client.watch::<RouteConfigResource>(
                        &name,
                        Arc::new(RouteConfigWatcher { manager: Arc::downgrade(self) }),
                    );
                    state.rds_handle = Some(handle);
                }
            }
            ListenerRouteSpecifier::Inline(route_config) => {
                if let Some(old) = state.rds_handle.take() {
                    old.cancel();
                }
                state.rds_name = None;
                state.route_config = Some(route_config);
            }
        }
        drop(state);
        self.maybe_report_update();
    }

    fn on_listener_error(self: &Arc<Self>, error: MeshwireError) {
        let have_listener = {
            let state = self.state.lock().expect("dependency state lock poisoned");
            state.closed || state.listener.is_some()
        };
        if have_listener {
            debug!(error = %error, "transient listener error; keeping cached config");
            return;
        }
        self.watcher.on_error("listener", error);
    }

    fn on_listener_does_not_exist(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            state.listener = None;
            state.route_config = None;
            state.rds_name = None;
            if let Some(handle) = state.rds_handle.take() {
                handle.cancel();
            }
            state.last_config = None;
        }
        self.watcher
            .on_resource_does_not_exist(&format!("listener {}", self.listener_name));
    }

    fn on_route_config_changed(self: &Arc<Self>, resource: Arc<RouteConfigResource>) {
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed || state.rds_name.is_none() {
                return;
            }
            debug!("received route config update");
            state.route_config = Some(resource);
        }
        self.maybe_report_update();
    }

    fn on_route_config_error(self: &Arc<Self>, error: MeshwireError) {
        let have_route_config = {
            let state = self.state.lock().expect("dependency state lock poisoned");
            state.closed || state.route_config.is_some()
        };
        if have_route_config {
            debug!(error = %error, "transient route config error; keeping cached config");
            return;
        }
        self.watcher.on_error("route config", error);
    }

    fn on_route_config_does_not_exist(self: &Arc<Self>) {
        let name = {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            state.route_config = None;
            state.last_config = None;
            state.rds_name.clone().unwrap_or_default()
        };
        self.watcher.on_resource_does_not_exist(&format!("route config {}", name));
    }

    fn on_cluster_changed(self: &Arc<Self>, name: &str, resource: Arc<ClusterResource>) {
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            let Some(watcher) = state.cluster_watchers.get_mut(name) else {
                return;
            };
            debug!(cluster = name, "received cluster update");
            watcher.update = Some(Ok(resource));
        }
        self.maybe_report_update();
    }

    fn on_cluster_error(self: &Arc<Self>, name: &str, error: MeshwireError) {
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            let Some(watcher) = state.cluster_watchers.get_mut(name) else {
                return;
            };
            match &watcher.update {
                Some(Ok(_)) => {
                    debug!(cluster = name, error = %error, "transient cluster error; keeping data");
                    return;
                }
                _ => watcher.update = Some(Err(error.to_string())),
            }
        }
        self.maybe_report_update();
    }

    fn on_cluster_does_not_exist(self: &Arc<Self>, name: &str) {
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            let Some(watcher) = state.cluster_watchers.get_mut(name) else {
                return;
            };
            watcher.update =
                Some(Err(format!("CDS resource {} does not exist", name)));
        }
        self.maybe_report_update();
    }

    fn on_endpoint_changed(self: &Arc<Self>, name: &str, resource: Arc<EndpointResource>) {
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            let Some(watcher) = state.endpoint_watchers.get_mut(name) else {
                return;
            };
            debug!(endpoint = name, "received endpoint update");
            watcher.endpoints = Some(resource);
            watcher.resolution_note.clear();
        }
        self.maybe_report_update();
    }

    fn on_endpoint_error(self: &Arc<Self>, name: &str, error: MeshwireError) {
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            let Some(watcher) = state.endpoint_watchers.get_mut(name) else {
                return;
            };
            if watcher.endpoints.is_some() {
                debug!(endpoint = name, error = %error, "transient endpoint error; keeping data");
                return;
            }
            watcher.resolution_note = format!("EDS resource {}: {}", name, error);
        }
        self.maybe_report_update();
    }

    fn on_endpoint_does_not_exist(self: &Arc<Self>, name: &str) {
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            let Some(watcher) = state.endpoint_watchers.get_mut(name) else {
                return;
            };
            watcher.endpoints = None;
            watcher.resolution_note = format!("EDS resource {} does not exist", name);
        }
        self.maybe_report_update();
    }

    fn on_dns_result(self: &Arc<Self>, host_port: &str, result: Result<Vec<SocketAddr>>) {
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            let Some(dns) = state.dns_resolvers.get_mut(host_port) else {
                return;
            };
            match result {
                Ok(addresses) => {
                    dns.endpoints = Some(Arc::new(dns_endpoint_resource(&addresses)));
                    dns.resolution_note.clear();
                }
                Err(error) => {
                    dns.endpoints = None;
                    dns.resolution_note =
                        format!("DNS resolution failed for {}: {}", host_port, error);
                }
            }
        }
        self.maybe_report_update();
    }

    fn on_subscription_dropped(self: &Arc<Self>, name: &str) {
        let newly_unreferenced = {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            match state.subscriptions.get(name) {
                Some(weak) if weak.upgrade().is_none() => {
                    state.subscriptions.remove(name);
                    !state.clusters_from_route_config.contains(name)
                }
                _ => false,
            }
        };
        if newly_unreferenced {
            self.maybe_report_update();
        }
    }

    /// Recompute the snapshot. Walks the whole cluster graph every time so
    /// that the active watch set stays exactly the referenced set, then
    /// emits iff every referenced resource is complete.
    fn maybe_report_update(self: &Arc<Self>) {
        let mut emit: Option<Arc<XdsConfig>> = None;
        {
            let mut state = self.state.lock().expect("dependency state lock poisoned");
            if state.closed {
                return;
            }
            let Some(listener) = state.listener.clone() else {
                return;
            };
            let Some(route_config) = state.route_config.clone() else {
                return;
            };
            let virtual_host_index = match find_virtual_host(
                &route_config.virtual_hosts,
                &self.data_plane_authority,
            ) {
                Some(index) => index,
                None => {
                    state.last_config = None;
                    state.clusters_from_route_config.clear();
                    let message = format!(
                        "could not find VirtualHost for {} in RouteConfiguration",
                        self.data_plane_authority
                    );
                    drop(state);
                    self.watcher.on_error("route config", MeshwireError::dependency(message));
                    return;
                }
            };

            state.clusters_from_route_config =
                clusters_referenced_by(&route_config.virtual_hosts[virtual_host_index]);

            let mut clusters_to_watch = state.clusters_from_route_config.clone();
            state.subscriptions.retain(|name, weak| {
                if weak.upgrade().is_some() {
                    clusters_to_watch.insert(name.clone());
                    true
                } else {
                    false
                }
            });

            let mut cluster_config_map = BTreeMap::new();
            let mut eds_seen = BTreeSet::new();
            let mut dns_seen = BTreeSet::new();
            let mut have_all_resources = true;
            for cluster in &clusters_to_watch {
                have_all_resources &= self.populate_cluster_config(
                    &mut state,
                    cluster,
                    0,
                    &mut cluster_config_map,
                    &mut eds_seen,
                    &mut dns_seen,
                    None,
                );
            }

            // Cancel watches for anything no longer referenced.
            state.cluster_watchers.retain(|name, watcher| {
                if cluster_config_map.contains_key(name) {
                    return true;
                }
                debug!(cluster = name, "cancelling cluster watch");
                if let Some(handle) = watcher.handle.take() {
                    handle.cancel();
                }
                false
            });
            state.endpoint_watchers.retain(|name, watcher| {
                if eds_seen.contains(name) {
                    return true;
                }
                debug!(endpoint = name, "cancelling endpoint watch");
                if let Some(handle) = watcher.handle.take() {
                    handle.cancel();
                }
                false
            });
            state.dns_resolvers.retain(|host_port, dns| {
                if dns_seen.contains(host_port) {
                    return true;
                }
                debug!(hostname = host_port, "stopping DNS resolver");
                dns.token.cancel();
                false
            });

            if !have_all_resources {
                debug!("dependency graph incomplete; not emitting config");
                return;
            }
            let config = Arc::new(XdsConfig {
                listener,
                route_config,
                virtual_host_index,
                clusters: cluster_config_map,
            });
            if state.last_config.as_ref() == Some(&config) {
                return;
            }
            state.last_config = Some(config.clone());
            emit = Some(config);
        }
        if let Some(config) = emit {
            info!(clusters = config.clusters.len(), "emitting composite config");
            self.watcher.on_update(config);
        }
    }

    /// Port of the recursive cluster walk: ensures watches exist, fills
    /// the config map, and reports completeness. `parent_leaves`
    /// accumulates leaf names for an enclosing aggregate cluster.
    #[allow(clippy::too_many_arguments)]
    fn populate_cluster_config(
        self: &Arc<Self>,
        state: &mut DependencyState,
        name: &str,
        depth: usize,
        cluster_config_map: &mut BTreeMap<String, std::result::Result<ClusterConfig, String>>,
        eds_seen: &mut BTreeSet<String>,
        dns_seen: &mut BTreeSet<String>,
        parent_leaves: Option<&mut std::result::Result<Vec<String>, String>>,
    ) -> bool {
        if depth == MAX_AGGREGATE_RECURSION_DEPTH {
            if let Some(leaves) = parent_leaves {
                *leaves = Err("aggregate cluster graph exceeds max depth".to_string());
            }
            return true;
        }
        // An entry per cluster even before data arrives, both to terminate
        // cycles and to keep the CDS watch alive through the prune below.
        if cluster_config_map.contains_key(name) {
            return true;
        }
        cluster_config_map
            .insert(name.to_string(), Err("cluster data not yet available".to_string()));

        let watcher = state.cluster_watchers.entry(name.to_string()).or_default();
        if watcher.handle.is_none() {
            debug!(cluster = name, "starting cluster watch");
            let handle = self.client.watch::<ClusterResource>(
                name,
                Arc::new(ClusterWatcher {
                    manager: Arc::downgrade(self),
                    name: name.to_string(),
                }),
            );
            watcher.handle = Some(handle);
            return false;
        }
        let update = match watcher.update.clone() {
            None => return false,
            Some(Err(error)) => {
                cluster_config_map.insert(name.to_string(), Err(error));
                return true;
            }
            Some(Ok(resource)) => resource,
        };

        match update.kind.clone() {
            ClusterKind::Eds { eds_service_name } => {
                let eds_resource_name = if eds_service_name.is_empty() {
                    name.to_string()
                } else {
                    eds_service_name
                };
                eds_seen.insert(eds_resource_name.clone());
                let eds_state =
                    state.endpoint_watchers.entry(eds_resource_name.clone()).or_default();
                if eds_state.handle.is_none() {
                    debug!(endpoint = %eds_resource_name, "starting endpoint watch");
                    let handle = self.client.watch::<EndpointResource>(
                        &eds_resource_name,
                        Arc::new(EndpointWatcher {
                            manager: Arc::downgrade(self),
                            name: eds_resource_name.clone(),
                        }),
                    );
                    eds_state.handle = Some(handle);
                    return false;
                }
                if !eds_state.received() {
                    return false;
                }
                let config = ClusterConfig {
                    cluster: update,
                    children: ClusterChildren::Endpoints {
                        endpoints: eds_state.endpoints.clone(),
                        resolution_note: eds_state.resolution_note.clone(),
                    },
                };
                cluster_config_map.insert(name.to_string(), Ok(config));
                if let Some(leaves) = parent_leaves {
                    if let Ok(leaves) = leaves.as_mut() {
                        leaves.push(name.to_string());
                    }
                }
                true
            }
            ClusterKind::LogicalDns { hostname } => {
                dns_seen.insert(hostname.clone());
                if !state.dns_resolvers.contains_key(&hostname) {
                    debug!(hostname = %hostname, "starting DNS resolver");
                    let token = self.shutdown.child_token();
                    state.dns_resolvers.insert(
                        hostname.clone(),
                        DnsState {
                            token: token.clone(),
                            endpoints: None,
                            resolution_note: String::new(),
                        },
                    );
                    let manager = self.clone();
                    let resolver = self.dns_resolver.clone();
                    let host_port = hostname.clone();
                    tokio::spawn(async move {
                        let result = tokio::select! {
                            _ = token.cancelled() => return,
                            result = resolver.resolve(&host_port) => result,
                        };
                        let job = manager.clone();
                        manager
                            .serializer
                            .post(move || job.on_dns_result(&host_port, result));
                    });
                    return false;
                }
                let dns_state = state.dns_resolvers.get(&hostname).expect("just ensured");
                if !dns_state.received() {
                    return false;
                }
                let config = ClusterConfig {
                    cluster: update,
                    children: ClusterChildren::Endpoints {
                        endpoints: dns_state.endpoints.clone(),
                        resolution_note: dns_state.resolution_note.clone(),
                    },
                };
                cluster_config_map.insert(name.to_string(), Ok(config));
                if let Some(leaves) = parent_leaves {
                    if let Ok(leaves) = leaves.as_mut() {
                        leaves.push(name.to_string());
                    }
                }
                true
            }
            ClusterKind::Aggregate { prioritized_cluster_names } => {
                let mut child_leaves: std::result::Result<Vec<String>, String> = Ok(Vec::new());
                let mut have_all_resources = true;
                for child in &prioritized_cluster_names {
                    have_all_resources &= self.populate_cluster_config(
                        state,
                        child,
                        depth + 1,
                        cluster_config_map,
                        eds_seen,
                        dns_seen,
                        Some(&mut child_leaves),
                    );
                    if child_leaves.is_err() {
                        break;
                    }
                }
                match child_leaves {
                    Err(error) => {
                        warn!(cluster = name, error = %error, "aggregate expansion failed");
                        cluster_config_map.insert(name.to_string(), Err(error.clone()));
                        if let Some(leaves) = parent_leaves {
                            *leaves = Err(error);
                        }
                        true
                    }
                    Ok(leaf_clusters) => {
                        if let Some(leaves) = parent_leaves {
                            if let Ok(leaves) = leaves.as_mut() {
                                leaves.extend(leaf_clusters.iter().cloned());
                            }
                        }
                        if have_all_resources && leaf_clusters.is_empty() {
                            cluster_config_map.insert(
                                name.to_string(),
                                Err(format!(
                                    "aggregate cluster dependency graph for {} has no leaf clusters",
                                    name
                                )),
                            );
                            return true;
                        }
                        cluster_config_map.insert(
                            name.to_string(),
                            Ok(ClusterConfig {
                                cluster: update,
                                children: ClusterChildren::Aggregate { leaf_clusters },
                            }),
                        );
                        have_all_resources
                    }
                }
            }
        }
    }
}

/// Clusters referenced by the selected virtual host's route actions.
fn clusters_referenced_by(virtual_host: &VirtualHost) -> BTreeSet<String> {
    let mut clusters = BTreeSet::new();
    for route in &virtual_host.routes {
        let RouteActionVariant::Forward(action) = &route.action else {
            continue;
        };
        match &action.kind {
            RouteActionKind::Cluster(name) => {
                clusters.insert(name.clone());
            }
            RouteActionKind::WeightedClusters(weighted) => {
                for entry in weighted {
                    clusters.insert(entry.name.clone());
                }
            }
            // Plugin-selected clusters are pinned dynamically through
            // ClusterSubscription handles.
            RouteActionKind::ClusterSpecifierPlugin(_) => {}
        }
    }
    clusters
}

/// Synthesize an endpoint resource from DNS results: one priority, one
/// unnamed locality, weight-1 endpoints.
fn dns_endpoint_resource(addresses: &[SocketAddr]) -> EndpointResource {
    let locality_name =
        LocalityName { region: String::new(), zone: String::new(), sub_zone: String::new() };
    let endpoints = addresses
        .iter()
        .map(|address| WeightedEndpoint {
            address: match address {
                SocketAddr::V4(v4) => format!("ipv4:{}:{}", v4.ip(), v4.port()),
                SocketAddr::V6(v6) => format!("ipv6:[{}]:{}", v6.ip(), v6.port()),
            },
            weight: 1,
            health_status: HealthStatus::Unknown,
        })
        .collect();
    let mut localities = BTreeMap::new();
    localities.insert(
        locality_name.clone(),
        Locality { name: locality_name, lb_weight: 1, endpoints },
    );
    EndpointResource {
        priorities: vec![Priority { localities }],
        drop_config: Default::default(),
    }
}

struct ListenerWatcher {
    manager: Weak<DependencyManagerInner>,
}

impl ResourceWatcher<ListenerResource> for ListenerWatcher {
    fn on_resource_changed(&self, resource: Arc<ListenerResource>) {
        if let Some(manager) = self.manager.upgrade() {
            let job = manager.clone();
            manager.serializer.post(move || job.on_listener_changed(resource));
        }
    }

    fn on_error(&self, error: MeshwireError) {
        if let Some(manager) = self.manager.upgrade() {
            let job = manager.clone();
            manager.serializer.post(move || job.on_listener_error(error));
        }
    }

    fn on_resource_does_not_exist(&self) {
        if let Some(manager) = self.manager.upgrade() {
            let job = manager.clone();
            manager.serializer.post(move || job.on_listener_does_not_exist());
        }
    }
}

struct RouteConfigWatcher {
    manager: Weak<DependencyManagerInner>,
}

impl ResourceWatcher<RouteConfigResource> for RouteConfigWatcher {
    fn on_resource_changed(&self, resource: Arc<RouteConfigResource>) {
        if let Some(manager) = self.manager.upgrade() {
            let job = manager.clone();
            manager.serializer.post(move || job.on_route_config_changed(resource));
        }
    }

    fn on_error(&self, error: MeshwireError) {
        if let Some(manager) = self.manager.upgrade() {
            let job = manager.clone();
            manager.serializer.post(move || job.on_route_config_error(error));
        }
    }

    fn on_resource_does_not_exist(&self) {
        if let Some(manager) = self.manager.upgrade() {
            let job = manager.clone();
            manager.serializer.post(move || job.on_route_config_does_not_exist());
        }
    }
}

struct ClusterWatcher {
    manager: Weak<DependencyManagerInner>,
    name: String,
}

impl ResourceWatcher<ClusterResource> for ClusterWatcher {
    fn on_resource_changed(&self, resource: Arc<ClusterResource>) {
        if let Some(manager) = self.manager.upgrade() {
            let name = self.name.clone();
            let job = manager.clone();
            manager.serializer.post(move || job.on_cluster_changed(&name, resource));
        }
    }

    fn on_error(&self, error: MeshwireError) {
        if let Some(manager) = self.manager.upgrade() {
            let name = self.name.clone();
            let job = manager.clone();
            manager.serializer.post(move || job.on_cluster_error(&name, error));
        }
    }

    fn on_resource_does_not_exist(&self) {
        if let Some(manager) = self.manager.upgrade() {
            let name = self.name.clone();
            let job = manager.clone();
            manager.serializer.post(move || job.on_cluster_does_not_exist(&name));
        }
    }
}

struct EndpointWatcher {
    manager: Weak<DependencyManagerInner>,
    name: String,
}

impl ResourceWatcher<EndpointResource> for EndpointWatcher {
    fn on_resource_changed(&self, resource: Arc<EndpointResource>) {
        if let Some(manager) = self.manager.upgrade() {
            let name = self.name.clone();
            let job = manager.clone();
            manager.serializer.post(move || job.on_endpoint_changed(&name, resource));
        }
    }

    fn on_error(&self, error: MeshwireError) {
        if let Some(manager) = self.manager.upgrade() {
            let name = self.name.clone();
            let job = manager.clone();
            manager.serializer.post(move || job.on_endpoint_error(&name, error));
        }
    }

    fn on_resource_does_not_exist(&self) {
        if let Some(manager) = self.manager.upgrade() {
            let name = self.name.clone();
            let job = manager.clone();
            manager.serializer.post(move || job.on_endpoint_does_not_exist(&name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_results_become_single_locality_endpoints() {
        let addresses = vec![
            "127.0.0.1:443".parse().unwrap(),
            "[::1]:8080".parse().unwrap(),
        ];
        let resource = dns_endpoint_resource(&addresses);
        assert_eq!(resource.priorities.len(), 1);
        let locality = resource.priorities[0].localities.values().next().unwrap();
        assert_eq!(locality.lb_weight, 1);
        assert_eq!(locality.name.region, "");
        assert_eq!(locality.endpoints[0].address, "ipv4:127.0.0.1:443");
        assert_eq!(locality.endpoints[0].weight, 1);
        assert_eq!(locality.endpoints[1].address, "ipv6:[::1]:8080");
    }

    #[test]
    fn referenced_clusters_cover_all_action_kinds() {
        use crate::xds::matchers::StringMatcher;
        use crate::xds::route::{ClusterWeight, Route, RouteAction, RouteMatchers};

        fn route(kind: RouteActionKind) -> Route {
            Route {
                matchers: RouteMatchers {
                    path_matcher: StringMatcher::Prefix {
                        value: String::new(),
                        case_sensitive: true,
                    },
                    header_matchers: Vec::new(),
                    fraction_per_million: None,
                },
                action: RouteActionVariant::Forward(RouteAction {
                    kind,
                    hash_policies: Vec::new(),
                    retry_policy: None,
                    max_stream_duration: None,
                }),
                typed_per_filter_config: Default::default(),
            }
        }

        let vhost = VirtualHost {
            domains: vec!["*".to_string()],
            routes: vec![
                route(RouteActionKind::Cluster("a".to_string())),
                route(RouteActionKind::WeightedClusters(vec![
                    ClusterWeight { name: "b".to_string(), weight: 1 },
                    ClusterWeight { name: "c".to_string(), weight: 2 },
                ])),
                route(RouteActionKind::ClusterSpecifierPlugin("rls".to_string())),
            ],
            retry_policy: None,
            typed_per_filter_config: Default::default(),
        };
        let clusters = clusters_referenced_by(&vhost);
        assert_eq!(
            clusters.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
