//! Client facade.
//!
//! [`XdsClient`] is the public surface: start and cancel watches, reset
//! reconnect backoff, create load-report handles, dump the cache for
//! diagnostics, shut down. Public methods enqueue work on the client's
//! serializer and return once the job is queued; cache mutation never
//! happens on the caller's thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Bootstrap;
use crate::errors::{MeshwireError, Result};

use super::backoff::BackoffConfig;
use super::cache::{
    deliver_all, CacheEntryStatus, PendingNotification, ResourceCache, ResourceState,
    ResourceWatcher, WatcherAdapter, WatcherRecord,
};
use super::endpoint::LocalityName;
use super::lrs::LrsChannels;
use super::name::XdsResourceName;
use super::resource_type::{ops_for_type_path, ResourceType, ResourceTypeOps};
use super::serializer::WorkSerializer;
use super::stats::{LoadReportStore, StatsKey, XdsClusterDropStats, XdsClusterLocalityStats};
use super::transport::ChannelState;
use super::validation::XdsFeatures;

/// Tuning knobs for the client. The defaults are the production protocol
/// constants; tests shorten the timers.
#[derive(Debug, Clone)]
pub struct XdsClientOptions {
    pub features: XdsFeatures,
    /// How long a newly watched resource may stay unanswered before
    /// watchers get `on_resource_does_not_exist`.
    pub resource_does_not_exist_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for XdsClientOptions {
    fn default() -> Self {
        Self {
            features: XdsFeatures::default(),
            resource_does_not_exist_timeout: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
        }
    }
}

/// The xDS client. Cheap to clone; all clones share one cache and one set
/// of management-server channels.
#[derive(Clone)]
pub struct XdsClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub bootstrap: Bootstrap,
    pub options: XdsClientOptions,
    pub serializer: WorkSerializer,
    pub shutdown_token: CancellationToken,
    pub state: Mutex<ClientState>,
    pub load_reports: LoadReportStore,
    pub lrs: LrsChannels,
    next_watcher_id: AtomicU64,
}

#[derive(Default)]
pub(crate) struct ClientState {
    pub cache: ResourceCache,
    /// One ADS channel per management server, keyed by server identity.
    pub channels: HashMap<String, ChannelState>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        self.serializer.close();
    }
}

impl XdsClient {
    /// Create a client from a validated bootstrap. Bootstrap problems are
    /// the only constructor-time errors; no watcher ever fires for them.
    pub fn new(bootstrap: Bootstrap, options: XdsClientOptions) -> Result<Self> {
        bootstrap.validate()?;
        info!(
            servers = bootstrap.xds_servers.len(),
            authorities = bootstrap.authorities.len(),
            "creating xDS client"
        );
        let inner = Arc::new(ClientInner {
            bootstrap,
            options,
            serializer: WorkSerializer::new("xds-client"),
            shutdown_token: CancellationToken::new(),
            state: Mutex::new(ClientState::default()),
            load_reports: LoadReportStore::new(),
            lrs: LrsChannels::new(),
            next_watcher_id: AtomicU64::new(1),
        });
        Ok(Self { inner })
    }

    /// Convenience constructor reading the bootstrap from the environment.
    pub fn from_env(options: XdsClientOptions) -> Result<Self> {
        Self::new(Bootstrap::from_env()?, options)
    }

    /// Start a watch on a resource of type `T`. If a validated value is
    /// already cached it is delivered before any subsequent update. The
    /// returned handle cancels the watch when dropped or when
    /// [`WatchHandle::cancel`] is called.
    pub fn watch<T: ResourceType>(
        &self,
        name: &str,
        watcher: Arc<dyn ResourceWatcher<T>>,
    ) -> WatchHandle {
        let id = self.inner.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let record = WatcherRecord {
            id,
            cancelled: cancelled.clone(),
            watcher: Arc::new(WatcherAdapter::<T>::new(watcher)),
        };

        let ops = match ops_for_type_path(T::TYPE_PATH) {
            Some(ops) => ops,
            None => {
                // The resource-type set is closed; this is unreachable for
                // the four built-in types.
                record.watcher.on_error(MeshwireError::internal(format!(
                    "resource type '{}' is not registered",
                    T::TYPE_PATH
                )));
                return WatchHandle::inert(cancelled);
            }
        };

        let parsed = match XdsResourceName::parse(name, ops.type_path) {
            Ok(parsed) => parsed,
            Err(e) => {
                record.watcher.on_error(e);
                return WatchHandle::inert(cancelled);
            }
        };

        let handle = WatchHandle {
            client: Arc::downgrade(&self.inner),
            ops,
            authority: parsed.authority.clone(),
            key: parsed.key.clone(),
            watcher_id: id,
            cancelled,
            active: true,
        };

        let inner = self.inner.clone();
        self.inner.serializer.post(move || {
            inner.add_watcher(ops, parsed, record);
        });
        handle
    }

    /// Watch a Listener resource.
    pub fn watch_listener(
        &self,
        name: &str,
        watcher: Arc<dyn ResourceWatcher<super::listener::ListenerResource>>,
    ) -> WatchHandle {
        self.watch(name, watcher)
    }

    /// Watch a RouteConfiguration resource.
    pub fn watch_route_config(
        &self,
        name: &str,
        watcher: Arc<dyn ResourceWatcher<super::route::RouteConfigResource>>,
    ) -> WatchHandle {
        self.watch(name, watcher)
    }

    /// Watch a Cluster resource.
    pub fn watch_cluster(
        &self,
        name: &str,
        watcher: Arc<dyn ResourceWatcher<super::cluster::ClusterResource>>,
    ) -> WatchHandle {
        self.watch(name, watcher)
    }

    /// Watch an Endpoint (ClusterLoadAssignment) resource.
    pub fn watch_endpoint(
        &self,
        name: &str,
        watcher: Arc<dyn ResourceWatcher<super::endpoint::EndpointResource>>,
    ) -> WatchHandle {
        self.watch(name, watcher)
    }

    /// Force every channel waiting in backoff to reconnect immediately.
    pub fn reset_backoff(&self) {
        let inner = self.inner.clone();
        self.inner.serializer.post(move || {
            let state = inner.state.lock().expect("client state lock poisoned");
            for channel in state.channels.values() {
                channel.request_backoff_reset();
            }
        });
    }

    /// Get the drop-stats handle for a cluster. The LRS stream to the
    /// cluster's load-reporting server opens when the first handle for
    /// that server is created and closes when the last one is dropped.
    pub fn drop_stats(&self, cluster_name: &str, eds_service_name: &str) -> Arc<XdsClusterDropStats> {
        let key = StatsKey {
            server: self.default_lrs_server(),
            cluster_name: cluster_name.to_string(),
            eds_service_name: eds_service_name.to_string(),
        };
        let stats = self.inner.load_reports.drop_stats(key);
        self.inner.lrs.ensure_channel(&self.inner, self.default_lrs_server());
        stats
    }

    /// Get a locality-stats handle for a cluster locality.
    pub fn locality_stats(
        &self,
        cluster_name: &str,
        eds_service_name: &str,
        locality: LocalityName,
    ) -> Arc<XdsClusterLocalityStats> {
        let key = StatsKey {
            server: self.default_lrs_server(),
            cluster_name: cluster_name.to_string(),
            eds_service_name: eds_service_name.to_string(),
        };
        let stats = self.inner.load_reports.locality_stats(key, locality);
        self.inner.lrs.ensure_channel(&self.inner, self.default_lrs_server());
        stats
    }

    fn default_lrs_server(&self) -> String {
        // Cluster resources can only name the self server, so load always
        // reports to the default management server.
        self.inner.bootstrap.xds_servers[0].key()
    }

    /// Dump the cache in CSDS shape for diagnostics tooling.
    pub fn dump_config(&self) -> serde_json::Value {
        let state = self.inner.state.lock().expect("client state lock poisoned");
        let mut configs = Vec::new();
        for (key, entry) in &state.cache.entries {
            let mut config = json!({
                "type_url": key.type_url,
                "name": entry.wire_name,
                "version_info": entry.version,
                "client_status": entry.status,
                "serialized_byte_length": entry.serialized_bytes.len(),
            });
            if let Some(update_time) = entry.update_time {
                config["last_updated"] = json!(update_time.to_rfc3339());
            }
            if !entry.failed_details.is_empty() {
                config["error_state"] = json!({
                    "details": entry.failed_details,
                    "version_info": entry.failed_version,
                    "last_update_attempt": entry.failed_update_time.map(|t| t.to_rfc3339()),
                });
            }
            configs.push(config);
        }
        json!({
            "node": self.inner.bootstrap.node,
            "generic_xds_configs": configs,
        })
    }

    /// Shut down: cancel the streams, discard pending responses, clear all
    /// timers. No watcher fires after this returns.
    pub fn shutdown(&self) {
        info!("shutting down xDS client");
        self.inner.shutdown_token.cancel();
        self.inner.serializer.close();
        let mut state = self.inner.state.lock().expect("client state lock poisoned");
        for entry in state.cache.entries.values_mut() {
            entry.cancel_timer();
            for record in &entry.watchers {
                record.cancelled.store(true, Ordering::Release);
            }
        }
        state.cache.entries.clear();
        state.channels.clear();
    }
}

impl ClientInner {
    /// Serializer job: register a watcher, creating the cache entry and
    /// subscription when it is the first.
    fn add_watcher(
        self: Arc<Self>,
        ops: &'static ResourceTypeOps,
        name: XdsResourceName,
        record: WatcherRecord,
    ) {
        let mut notifications = Vec::new();
        {
            let mut state = self.state.lock().expect("client state lock poisoned");
            let key = super::cache::ResourceKey {
                type_url: ops.type_url,
                authority: name.authority.clone(),
                key: name.key.clone(),
            };

            let is_new = !state.cache.entries.contains_key(&key);
            let wire_name = name.canonical_wire_name(ops.type_path);
            let entry = state
                .cache
                .entries
                .entry(key.clone())
                .or_insert_with(|| ResourceState::new(wire_name.clone()));
            let was_pending_removal = std::mem::take(&mut entry.pending_removal);
            entry.watchers.push(record.clone());

            // Deliver current knowledge to the new watcher.
            if let Some(resource) = entry.resource.clone() {
                notifications.push(PendingNotification::Changed(record.clone(), resource));
            }
            match entry.status {
                CacheEntryStatus::DoesNotExist => {
                    notifications.push(PendingNotification::DoesNotExist(record.clone()));
                }
                CacheEntryStatus::Nacked if entry.resource.is_none() => {
                    notifications.push(PendingNotification::Error(
                        record.clone(),
                        MeshwireError::validation(entry.failed_details.clone()),
                    ));
                }
                _ => {}
            }

            if is_new {
                debug!(type_url = ops.type_path, name = %wire_name, "starting subscription");
                match self.subscribe_on_channel(&mut state, ops, &name.authority, &wire_name) {
                    Ok(stream_up) => {
                        if stream_up {
                            let timeout = self.options.resource_does_not_exist_timeout;
                            Self::arm_dne_timer(&self, &mut state, &key, timeout);
                        }
                    }
                    Err(e) => {
                        // No server for this authority: surface once to the
                        // watcher, keep the entry so cancellation works.
                        notifications.push(PendingNotification::Error(record, e));
                    }
                }
            } else if was_pending_removal {
                debug!(type_url = ops.type_path, name = %wire_name, "reusing delayed subscription");
            }
        }
        deliver_all(notifications);
    }

    /// Serializer job: remove a watcher; the last removal unsubscribes,
    /// immediately or delayed.
    pub(crate) fn remove_watcher(
        self: &Arc<Self>,
        ops: &'static ResourceTypeOps,
        authority: &str,
        resource_key: &str,
        watcher_id: u64,
        delay_unsubscription: bool,
    ) {
        let mut state = self.state.lock().expect("client state lock poisoned");
        let key = super::cache::ResourceKey {
            type_url: ops.type_url,
            authority: authority.to_string(),
            key: resource_key.to_string(),
        };
        let Some(entry) = state.cache.entries.get_mut(&key) else {
            return;
        };
        entry.watchers.retain(|record| record.id != watcher_id);
        if !entry.watchers.is_empty() {
            return;
        }
        if delay_unsubscription {
            entry.pending_removal = true;
            let inner = self.clone();
            let ops = ops;
            let key = key.clone();
            // Runs after any Watch already queued behind this cancel; if
            // nobody re-subscribed, the entry goes away then.
            self.serializer.post(move || {
                let mut state = inner.state.lock().expect("client state lock poisoned");
                let still_pending = state
                    .cache
                    .entries
                    .get(&key)
                    .map(|entry| entry.watchers.is_empty() && entry.pending_removal)
                    .unwrap_or(false);
                if still_pending {
                    inner.drop_entry(&mut state, ops, &key);
                }
            });
        } else {
            self.drop_entry(&mut state, ops, &key);
        }
    }

    fn drop_entry(
        &self,
        state: &mut ClientState,
        ops: &'static ResourceTypeOps,
        key: &super::cache::ResourceKey,
    ) {
        if let Some(mut entry) = state.cache.entries.remove(key) {
            entry.cancel_timer();
            debug!(type_url = ops.type_path, name = %entry.wire_name, "stopping subscription");
            self.unsubscribe_on_channel(state, ops, &key.authority, &entry.wire_name);
        }
    }

    /// Arm the does-not-exist timer for a REQUESTED entry.
    pub(crate) fn arm_dne_timer(
        self: &Arc<Self>,
        state: &mut ClientState,
        key: &super::cache::ResourceKey,
        timeout: Duration,
    ) {
        let Some(entry) = state.cache.entries.get_mut(key) else {
            return;
        };
        if entry.status != CacheEntryStatus::Requested || entry.dne_timer.is_some() {
            return;
        }
        entry.timer_generation += 1;
        let generation = entry.timer_generation;
        let inner = self.clone();
        let key = key.clone();
        let token = self.shutdown_token.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let serializer = inner.serializer.clone();
                    let inner = inner.clone();
                    serializer.post(move || inner.on_dne_timer_fired(key, generation));
                }
            }
        });
        entry.dne_timer = Some(super::cache::DoesNotExistTimer { task });
    }

    fn on_dne_timer_fired(self: Arc<Self>, key: super::cache::ResourceKey, generation: u64) {
        let mut notifications = Vec::new();
        {
            let mut state = self.state.lock().expect("client state lock poisoned");
            let Some(entry) = state.cache.entries.get_mut(&key) else {
                return;
            };
            if entry.timer_generation != generation
                || entry.status != CacheEntryStatus::Requested
            {
                return;
            }
            info!(type_url = key.type_url, name = %entry.wire_name, "resource timed out; does not exist");
            entry.dne_timer = None;
            entry.status = CacheEntryStatus::DoesNotExist;
            entry.resource = None;
            entry.notify_all(&mut notifications, PendingNotification::DoesNotExist);
        }
        deliver_all(notifications);
    }
}

/// Capability to cancel a watch. Dropping the handle cancels too.
pub struct WatchHandle {
    client: Weak<ClientInner>,
    ops: &'static ResourceTypeOps,
    authority: String,
    key: String,
    watcher_id: u64,
    cancelled: Arc<AtomicBool>,
    active: bool,
}

impl WatchHandle {
    fn inert(cancelled: Arc<AtomicBool>) -> Self {
        Self {
            client: Weak::new(),
            ops: &super::resource_type::INERT_OPS,
            authority: String::new(),
            key: String::new(),
            watcher_id: 0,
            cancelled,
            active: false,
        }
    }

    /// Cancel the watch. After this returns, no further callbacks reach
    /// the watcher. The subscription ends if this was the last watcher.
    pub fn cancel(mut self) {
        self.cancel_impl(false);
    }

    /// Cancel, keeping the subscription on the wire briefly so that an
    /// immediately following watch on the same resource reuses it and only
    /// one aggregated request is sent.
    pub fn cancel_for_replacement(mut self) {
        self.cancel_impl(true);
    }

    fn cancel_impl(&mut self, delay_unsubscription: bool) {
        if !self.active {
            return;
        }
        self.active = false;
        self.cancelled.store(true, Ordering::Release);
        let Some(inner) = self.client.upgrade() else {
            return;
        };
        let ops = self.ops;
        let authority = std::mem::take(&mut self.authority);
        let key = std::mem::take(&mut self.key);
        let watcher_id = self.watcher_id;
        let job_inner = inner.clone();
        inner.serializer.post(move || {
            job_inner.remove_watcher(ops, &authority, &key, watcher_id, delay_unsubscription);
        });
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel_impl(false);
    }
}
