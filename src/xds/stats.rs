//! Load-report counters.
//!
//! These are the only hot-path state touched outside the work serializer.
//! Scalar counters are shard-striped atomics read with a relaxed exchange;
//! map-valued counters (categorized drops, backend metrics) take a
//! per-shard lock held only long enough to move the map out. Shards are
//! assigned per thread with a deterministic hash and summed on snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::endpoint::LocalityName;

fn shard_count() -> usize {
    num_cpus::get().clamp(1, 32)
}

thread_local! {
    static THREAD_SHARD_SEED: u64 = {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    };
}

fn current_shard(shards: usize) -> usize {
    THREAD_SHARD_SEED.with(|seed| (*seed as usize) % shards)
}

/// Shard-striped monotonic counter.
#[derive(Debug)]
struct ShardedCounter {
    shards: Box<[AtomicU64]>,
}

impl ShardedCounter {
    fn new() -> Self {
        Self { shards: (0..shard_count()).map(|_| AtomicU64::new(0)).collect() }
    }

    fn add(&self, n: u64) {
        self.shards[current_shard(self.shards.len())].fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot_and_reset(&self) -> u64 {
        self.shards.iter().map(|shard| shard.swap(0, Ordering::Relaxed)).sum()
    }
}

/// Shard-striped gauge (for in-progress counts; read, never reset).
#[derive(Debug)]
struct ShardedGauge {
    shards: Box<[AtomicI64]>,
}

impl ShardedGauge {
    fn new() -> Self {
        Self { shards: (0..shard_count()).map(|_| AtomicI64::new(0)).collect() }
    }

    fn add(&self, n: i64) {
        self.shards[current_shard(self.shards.len())].fetch_add(n, Ordering::Relaxed);
    }

    fn load(&self) -> i64 {
        self.shards.iter().map(|shard| shard.load(Ordering::Relaxed)).sum()
    }
}

/// Shard-striped map of named counters; per-shard lock held only around a
/// move-out or a single entry bump.
#[derive(Debug)]
struct ShardedMap<V> {
    shards: Box<[Mutex<HashMap<String, V>>]>,
}

impl<V> ShardedMap<V> {
    fn new() -> Self {
        Self { shards: (0..shard_count()).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    fn update(&self, key: &str, f: impl FnOnce(&mut V), default: impl FnOnce() -> V) {
        let mut shard = self.shards[current_shard(self.shards.len())]
            .lock()
            .expect("stats shard lock poisoned");
        f(shard.entry(key.to_string()).or_insert_with(default));
    }

    fn take_all(&self) -> Vec<HashMap<String, V>> {
        self.shards
            .iter()
            .map(|shard| std::mem::take(&mut *shard.lock().expect("stats shard lock poisoned")))
            .collect()
    }
}

/// Snapshot of drop counters for one (cluster, eds_service_name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropStatsSnapshot {
    pub uncategorized_drops: u64,
    pub categorized_drops: BTreeMap<String, u64>,
}

impl DropStatsSnapshot {
    pub fn total(&self) -> u64 {
        self.uncategorized_drops + self.categorized_drops.values().sum::<u64>()
    }

    pub fn is_zero(&self) -> bool {
        self.uncategorized_drops == 0 && self.categorized_drops.values().all(|v| *v == 0)
    }

    fn merge(&mut self, other: DropStatsSnapshot) {
        self.uncategorized_drops += other.uncategorized_drops;
        for (category, count) in other.categorized_drops {
            *self.categorized_drops.entry(category).or_default() += count;
        }
    }
}

/// Snapshot of one locality's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalityStatsSnapshot {
    pub total_successful_requests: u64,
    pub total_error_requests: u64,
    pub total_issued_requests: u64,
    /// Gauge value at snapshot time; not reset.
    pub total_requests_in_progress: i64,
    pub backend_metrics: BTreeMap<String, BackendMetric>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BackendMetric {
    pub num_requests_finished_with_metric: u64,
    pub total_metric_value: f64,
}

impl LocalityStatsSnapshot {
    pub fn is_zero(&self) -> bool {
        self.total_successful_requests == 0
            && self.total_error_requests == 0
            && self.total_issued_requests == 0
            && self.total_requests_in_progress == 0
            && self.backend_metrics.is_empty()
    }

    fn merge(&mut self, other: LocalityStatsSnapshot) {
        self.total_successful_requests += other.total_successful_requests;
        self.total_error_requests += other.total_error_requests;
        self.total_issued_requests += other.total_issued_requests;
        self.total_requests_in_progress += other.total_requests_in_progress;
        for (name, metric) in other.backend_metrics {
            let entry = self.backend_metrics.entry(name).or_default();
            entry.num_requests_finished_with_metric += metric.num_requests_finished_with_metric;
            entry.total_metric_value += metric.total_metric_value;
        }
    }
}

/// Drop stats handle for one (cluster, eds_service_name) against one LRS
/// server. Returned to data-plane code; dropping the last clone merges the
/// final counts into the store so they are still reported once.
#[derive(Debug)]
pub struct XdsClusterDropStats {
    key: StatsKey,
    uncategorized: ShardedCounter,
    categorized: ShardedMap<u64>,
    store: Weak<Mutex<LoadReportMap>>,
}

impl XdsClusterDropStats {
    pub fn add_uncategorized_drops(&self) {
        self.uncategorized.add(1);
    }

    pub fn add_drop(&self, category: &str) {
        self.categorized.update(category, |count| *count += 1, || 0);
    }

    pub(crate) fn snapshot_and_reset(&self) -> DropStatsSnapshot {
        let mut snapshot = DropStatsSnapshot {
            uncategorized_drops: self.uncategorized.snapshot_and_reset(),
            ..Default::default()
        };
        for shard in self.categorized.take_all() {
            for (category, count) in shard {
                *snapshot.categorized_drops.entry(category).or_default() += count;
            }
        }
        snapshot
    }
}

impl Drop for XdsClusterDropStats {
    fn drop(&mut self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let final_snapshot = self.snapshot_and_reset();
        let mut map = store.lock().expect("load report map lock poisoned");
        map.retain_drop_stats(&self.key, final_snapshot);
    }
}

/// Locality stats handle for one (cluster, eds_service_name, locality).
#[derive(Debug)]
pub struct XdsClusterLocalityStats {
    key: StatsKey,
    locality: LocalityName,
    successful: ShardedCounter,
    error: ShardedCounter,
    issued: ShardedCounter,
    in_progress: ShardedGauge,
    backend_metrics: ShardedMap<BackendMetric>,
    store: Weak<Mutex<LoadReportMap>>,
}

impl XdsClusterLocalityStats {
    pub fn locality(&self) -> &LocalityName {
        &self.locality
    }

    pub fn add_call_started(&self) {
        self.issued.add(1);
        self.in_progress.add(1);
    }

    pub fn add_call_finished(&self, failed: bool) {
        if failed {
            self.error.add(1);
        } else {
            self.successful.add(1);
        }
        self.in_progress.add(-1);
    }

    /// Record named backend metrics reported with a finished call.
    pub fn add_backend_metrics(&self, metrics: &[(&str, f64)]) {
        for (name, value) in metrics {
            self.backend_metrics.update(
                name,
                |metric| {
                    metric.num_requests_finished_with_metric += 1;
                    metric.total_metric_value += value;
                },
                BackendMetric::default,
            );
        }
    }

    pub(crate) fn snapshot_and_reset(&self) -> LocalityStatsSnapshot {
        let mut snapshot = LocalityStatsSnapshot {
            total_successful_requests: self.successful.snapshot_and_reset(),
            total_error_requests: self.error.snapshot_and_reset(),
            total_issued_requests: self.issued.snapshot_and_reset(),
            total_requests_in_progress: self.in_progress.load(),
            ..Default::default()
        };
        for shard in self.backend_metrics.take_all() {
            for (name, metric) in shard {
                let entry = snapshot.backend_metrics.entry(name).or_default();
                entry.num_requests_finished_with_metric += metric.num_requests_finished_with_metric;
                entry.total_metric_value += metric.total_metric_value;
            }
        }
        snapshot
    }
}

impl Drop for XdsClusterLocalityStats {
    fn drop(&mut self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let final_snapshot = self.snapshot_and_reset();
        let mut map = store.lock().expect("load report map lock poisoned");
        map.retain_locality_stats(&self.key, &self.locality, final_snapshot);
    }
}

/// (lrs server, cluster, eds_service_name) identity for stats entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StatsKey {
    pub server: String,
    pub cluster_name: String,
    pub eds_service_name: String,
}

#[derive(Default)]
struct DropStatsEntry {
    live: Weak<XdsClusterDropStats>,
    /// Counts from handles dropped since the last report.
    retained: DropStatsSnapshot,
}

#[derive(Default)]
struct LocalityStatsEntry {
    live: Vec<Weak<XdsClusterLocalityStats>>,
    retained: LocalityStatsSnapshot,
}

#[derive(Default)]
struct LoadReportMap {
    drops: HashMap<StatsKey, DropStatsEntry>,
    localities: HashMap<StatsKey, HashMap<LocalityName, LocalityStatsEntry>>,
}

impl LoadReportMap {
    fn retain_drop_stats(&mut self, key: &StatsKey, snapshot: DropStatsSnapshot) {
        if let Some(entry) = self.drops.get_mut(key) {
            entry.retained.merge(snapshot);
            entry.live = Weak::new();
        }
    }

    fn retain_locality_stats(
        &mut self,
        key: &StatsKey,
        locality: &LocalityName,
        snapshot: LocalityStatsSnapshot,
    ) {
        if let Some(localities) = self.localities.get_mut(key) {
            if let Some(entry) = localities.get_mut(locality) {
                entry.retained.merge(snapshot);
                entry.live.retain(|weak| weak.upgrade().is_some());
            }
        }
    }
}

/// One cluster's worth of data in an LRS report.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClusterStatsReport {
    pub cluster_name: String,
    pub eds_service_name: String,
    pub dropped: DropStatsSnapshot,
    pub localities: BTreeMap<LocalityName, LocalityStatsSnapshot>,
}

/// Per-client registry of load-report counters, shared between the facade
/// (handle creation) and the LRS stream (periodic collection).
#[derive(Clone, Default)]
pub(crate) struct LoadReportStore {
    inner: Arc<Mutex<LoadReportMap>>,
}

impl LoadReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the drop-stats handle for a key. An existing live
    /// handle is shared.
    pub fn drop_stats(&self, key: StatsKey) -> Arc<XdsClusterDropStats> {
        let mut map = self.inner.lock().expect("load report map lock poisoned");
        let entry = map.drops.entry(key.clone()).or_default();
        if let Some(existing) = entry.live.upgrade() {
            return existing;
        }
        let stats = Arc::new(XdsClusterDropStats {
            key,
            uncategorized: ShardedCounter::new(),
            categorized: ShardedMap::new(),
            store: Arc::downgrade(&self.inner),
        });
        entry.live = Arc::downgrade(&stats);
        stats
    }

    /// Create a locality-stats handle. Multiple live handles for the same
    /// locality are summed at report time.
    pub fn locality_stats(
        &self,
        key: StatsKey,
        locality: LocalityName,
    ) -> Arc<XdsClusterLocalityStats> {
        let mut map = self.inner.lock().expect("load report map lock poisoned");
        let stats = Arc::new(XdsClusterLocalityStats {
            key: key.clone(),
            locality: locality.clone(),
            successful: ShardedCounter::new(),
            error: ShardedCounter::new(),
            issued: ShardedCounter::new(),
            in_progress: ShardedGauge::new(),
            backend_metrics: ShardedMap::new(),
            store: Arc::downgrade(&self.inner),
        });
        map.localities
            .entry(key)
            .or_default()
            .entry(locality)
            .or_default()
            .live
            .push(Arc::downgrade(&stats));
        stats
    }

    /// Whether any stats are registered for the given LRS server.
    pub fn has_stats_for_server(&self, server: &str) -> bool {
        let map = self.inner.lock().expect("load report map lock poisoned");
        map.drops.keys().any(|key| key.server == server)
            || map.localities.keys().any(|key| key.server == server)
    }

    /// Snapshot and reset every counter for the given server, pruning
    /// entries whose handles are gone and whose retained counts are zero.
    pub fn collect_reports(&self, server: &str) -> Vec<ClusterStatsReport> {
        // Handles upgraded below must outlive the map guard: dropping the
        // last Arc of a handle runs its Drop impl, which takes this lock.
        let mut drop_keepalive: Vec<Arc<XdsClusterDropStats>> = Vec::new();
        let mut locality_keepalive: Vec<Arc<XdsClusterLocalityStats>> = Vec::new();
        let mut map = self.inner.lock().expect("load report map lock poisoned");
        let mut reports: HashMap<(String, String), ClusterStatsReport> = HashMap::new();

        let mut dead_drops = Vec::new();
        for (key, entry) in map.drops.iter_mut() {
            if key.server != server {
                continue;
            }
            let mut snapshot = std::mem::take(&mut entry.retained);
            match entry.live.upgrade() {
                Some(stats) => {
                    snapshot.merge(stats.snapshot_and_reset());
                    drop_keepalive.push(stats);
                }
                None if snapshot.is_zero() => {
                    dead_drops.push(key.clone());
                    continue;
                }
                None => {}
            }
            let report = reports
                .entry((key.cluster_name.clone(), key.eds_service_name.clone()))
                .or_insert_with(|| ClusterStatsReport {
                    cluster_name: key.cluster_name.clone(),
                    eds_service_name: key.eds_service_name.clone(),
                    ..Default::default()
                });
            report.dropped.merge(snapshot);
        }
        for key in dead_drops {
            map.drops.remove(&key);
        }

        let mut dead_localities = Vec::new();
        for (key, localities) in map.localities.iter_mut() {
            if key.server != server {
                continue;
            }
            let mut dead = Vec::new();
            for (locality, entry) in localities.iter_mut() {
                let mut snapshot = std::mem::take(&mut entry.retained);
                entry.live.retain(|weak| weak.upgrade().is_some());
                for weak in &entry.live {
                    if let Some(stats) = weak.upgrade() {
                        snapshot.merge(stats.snapshot_and_reset());
                        locality_keepalive.push(stats);
                    }
                }
                if entry.live.is_empty() && snapshot.is_zero() {
                    dead.push(locality.clone());
                    continue;
                }
                let report = reports
                    .entry((key.cluster_name.clone(), key.eds_service_name.clone()))
                    .or_insert_with(|| ClusterStatsReport {
                        cluster_name: key.cluster_name.clone(),
                        eds_service_name: key.eds_service_name.clone(),
                        ..Default::default()
                    });
                report.localities.insert(locality.clone(), snapshot);
            }
            for locality in dead {
                localities.remove(&locality);
            }
            if localities.is_empty() {
                dead_localities.push(key.clone());
            }
        }
        for key in dead_localities {
            map.localities.remove(&key);
        }

        drop(map);
        drop(drop_keepalive);
        drop(locality_keepalive);

        let mut out: Vec<ClusterStatsReport> = reports.into_values().collect();
        out.sort_by(|a, b| {
            (a.cluster_name.as_str(), a.eds_service_name.as_str())
                .cmp(&(b.cluster_name.as_str(), b.eds_service_name.as_str()))
        });
        out
    }
}
