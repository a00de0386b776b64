//! Resource cache and watcher registry.
//!
//! One [`ResourceState`] exists per `(type, authority, key)` while at least
//! one watcher is registered. The cache is the authoritative record of the
//! latest accepted value, its version metadata, and rejection diagnostics;
//! it also owns the per-resource does-not-exist timer. All mutation
//! happens on the client's work serializer; watcher callbacks are invoked
//! only after the state lock is released, with a cancellation check
//! immediately before each delivery.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::errors::MeshwireError;

use super::resource_type::{ErasedResource, ResourceType};

/// Cache entry identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ResourceKey {
    pub type_url: &'static str,
    pub authority: String,
    pub key: String,
}

/// Client-observed status of a resource, mirroring the CSDS wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheEntryStatus {
    /// Subscribed, no response delivered yet.
    Requested,
    /// Latest payload accepted.
    Acked,
    /// Latest payload rejected; any previously accepted value is retained.
    Nacked,
    /// Reported absent by the server or timed out waiting.
    DoesNotExist,
}

/// Typed watcher interface handed to [`crate::xds::client::XdsClient::watch`].
///
/// Error delivery is transient: it never invalidates a previously
/// delivered value. Notifications for one watcher arrive in serial order.
pub trait ResourceWatcher<T: ResourceType>: Send + Sync + 'static {
    fn on_resource_changed(&self, resource: Arc<T::Resource>);
    fn on_error(&self, error: MeshwireError);
    fn on_resource_does_not_exist(&self);
}

/// Type-erased watcher stored in the cache.
pub(crate) trait ErasedWatcher: Send + Sync {
    fn on_changed(&self, resource: ErasedResource);
    fn on_error(&self, error: MeshwireError);
    fn on_does_not_exist(&self);
}

pub(crate) struct WatcherAdapter<T: ResourceType> {
    watcher: Arc<dyn ResourceWatcher<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ResourceType> WatcherAdapter<T> {
    pub fn new(watcher: Arc<dyn ResourceWatcher<T>>) -> Self {
        Self { watcher, _marker: PhantomData }
    }
}

impl<T: ResourceType> ErasedWatcher for WatcherAdapter<T> {
    fn on_changed(&self, resource: ErasedResource) {
        let resource: Arc<dyn Any + Send + Sync> = resource;
        match resource.downcast::<T::Resource>() {
            Ok(resource) => self.watcher.on_resource_changed(resource),
            Err(_) => debug!(
                type_url = T::TYPE_PATH,
                "dropping update with mismatched resource type"
            ),
        }
    }

    fn on_error(&self, error: MeshwireError) {
        self.watcher.on_error(error);
    }

    fn on_does_not_exist(&self) {
        self.watcher.on_resource_does_not_exist();
    }
}

/// A registered watcher plus its cancellation flag. The flag is set
/// synchronously by `WatchHandle::cancel`, so no callback runs after
/// cancellation returns.
#[derive(Clone)]
pub(crate) struct WatcherRecord {
    pub id: u64,
    pub cancelled: Arc<AtomicBool>,
    pub watcher: Arc<dyn ErasedWatcher>,
}

/// A notification captured under the state lock and delivered after it is
/// released.
pub(crate) enum PendingNotification {
    Changed(WatcherRecord, ErasedResource),
    Error(WatcherRecord, MeshwireError),
    DoesNotExist(WatcherRecord),
}

impl PendingNotification {
    pub fn deliver(self) {
        match self {
            PendingNotification::Changed(record, resource) => {
                if !record.cancelled.load(Ordering::Acquire) {
                    record.watcher.on_changed(resource);
                }
            }
            PendingNotification::Error(record, error) => {
                if !record.cancelled.load(Ordering::Acquire) {
                    record.watcher.on_error(error);
                }
            }
            PendingNotification::DoesNotExist(record) => {
                if !record.cancelled.load(Ordering::Acquire) {
                    record.watcher.on_does_not_exist();
                }
            }
        }
    }
}

pub(crate) fn deliver_all(notifications: Vec<PendingNotification>) {
    for notification in notifications {
        notification.deliver();
    }
}

/// Handle to a pending does-not-exist timer.
pub(crate) struct DoesNotExistTimer {
    pub task: tokio::task::JoinHandle<()>,
}

impl DoesNotExistTimer {
    pub fn cancel(self) {
        self.task.abort();
    }
}

/// Per-resource cache entry.
pub(crate) struct ResourceState {
    /// The name as it appears on the wire (canonicalized for xdstp names).
    pub wire_name: String,
    pub status: CacheEntryStatus,
    pub resource: Option<ErasedResource>,
    /// Raw payload of the last accepted value, for diagnostics.
    pub serialized_bytes: Vec<u8>,
    /// Server-assigned version of the last accepted payload.
    pub version: String,
    pub update_time: Option<DateTime<Utc>>,
    pub failed_version: String,
    pub failed_details: String,
    pub failed_update_time: Option<DateTime<Utc>>,
    pub watchers: Vec<WatcherRecord>,
    /// Set when the last watcher cancelled with delayed unsubscription; a
    /// follow-up serializer job removes the entry unless a new watcher
    /// arrived in between.
    pub pending_removal: bool,
    pub dne_timer: Option<DoesNotExistTimer>,
    pub timer_generation: u64,
}

impl ResourceState {
    pub fn new(wire_name: String) -> Self {
        Self {
            wire_name,
            status: CacheEntryStatus::Requested,
            resource: None,
            serialized_bytes: Vec::new(),
            version: String::new(),
            update_time: None,
            failed_version: String::new(),
            failed_details: String::new(),
            failed_update_time: None,
            watchers: Vec::new(),
            pending_removal: false,
            dne_timer: None,
            timer_generation: 0,
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.dne_timer.take() {
            timer.cancel();
        }
        self.timer_generation += 1;
    }

    /// Queue a notification for every registered watcher.
    pub fn notify_all(
        &self,
        out: &mut Vec<PendingNotification>,
        make: impl Fn(WatcherRecord) -> PendingNotification,
    ) {
        for record in &self.watchers {
            out.push(make(record.clone()));
        }
    }
}

/// The watcher-facing cache map. Transport and facade code manipulate it
/// through [`crate::xds::client::ClientInner`] on the work serializer.
#[derive(Default)]
pub(crate) struct ResourceCache {
    pub entries: HashMap<ResourceKey, ResourceState>,
}

impl ResourceCache {
    /// All keys of one type whose authority resolves to the given server,
    /// used for state-of-the-world deletion sweeps.
    pub fn keys_for_type(&self, type_url: &'static str) -> Vec<ResourceKey> {
        self.entries.keys().filter(|key| key.type_url == type_url).cloned().collect()
    }
}
