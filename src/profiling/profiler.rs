//! The facade applications call: `begin`/`end` a hit, `log` a line, swap the
//! active [`Collector`], and `flush` on shutdown.
//!
//! Grounded in the `PerformanceProfiler` facade shape in `profiling/mod.rs`
//! (one struct fronting several sub-profilers, `start`/`stop` lifecycle), but
//! the sub-profilers here are per-`bucket*key` [`ProfilerTarget`]s rather than
//! one profiler per resource kind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::collector::{validate_bucket_key, Collector};
use crate::machine::MachineSampler;
use crate::profiling::hit::{target_map_key, Hit};
use crate::profiling::target::ProfilerTarget;

/// Process-wide hit-point profiler. Cheap to clone (everything behind `Arc`);
/// applications typically hold one instance for the whole process.
#[derive(Clone)]
pub struct Profiler {
    inner: Arc<Inner>,
}

struct Inner {
    collector: RwLock<Arc<dyn Collector>>,
    targets: DashMap<String, Arc<ProfilerTarget>>,
    hit_count: AtomicU64,
    open_hits_count: AtomicU64,
    machine: Arc<MachineSampler>,
}

/// No-op collector used before a real one is attached; `enabled()` is false
/// so `begin` short-circuits without allocating a target.
struct NullCollector;

#[async_trait::async_trait]
impl Collector for NullCollector {
    fn enabled(&self) -> bool {
        false
    }
    fn bucket_enabled(&self, _bucket_key: &str) -> bool {
        false
    }
    async fn feed(&self, _stats: crate::profiling::target::Stats, _hit: Hit) {}
    async fn log(&self, _bucket_key: &str, _text: &str) {}
    async fn flush(&self, _stop_logging: bool) {}
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                collector: RwLock::new(Arc::new(NullCollector)),
                targets: DashMap::new(),
                hit_count: AtomicU64::new(0),
                open_hits_count: AtomicU64::new(0),
                machine: MachineSampler::global(),
            }),
        }
    }

    pub fn set_collector(&self, collector: Arc<dyn Collector>) {
        *self.inner.collector.write() = collector;
    }

    fn collector(&self) -> Arc<dyn Collector> {
        self.inner.collector.read().clone()
    }

    /// Whether hits would currently be recorded for `bucket_key` (or overall,
    /// if `bucket_key` is `None`).
    pub fn enabled(&self, bucket_key: Option<&str>) -> bool {
        let collector = self.collector();
        if !collector.enabled() {
            return false;
        }
        match bucket_key {
            Some(bucket_key) => collector.bucket_enabled(bucket_key),
            None => true,
        }
    }

    /// Opens a hit, or returns `None` if the bucket is disabled. A `None`
    /// return makes a later `end` a guaranteed no-op, which is the whole
    /// point: callers write `let hit = profiler.begin(...); ...; profiler.end(hit, "")`
    /// unconditionally and pay nothing when profiling is off.
    pub fn begin(&self, bucket_key: &str, key: &str, title: impl Into<String>) -> Option<Hit> {
        if validate_bucket_key(bucket_key).is_err() {
            return None;
        }
        if !self.enabled(Some(bucket_key)) {
            return None;
        }

        let global_index = self.inner.hit_count.fetch_add(1, Ordering::SeqCst) + 1;
        let open_hits_at_open = self.inner.open_hits_count.fetch_add(1, Ordering::SeqCst) + 1;
        let target = self
            .inner
            .targets
            .entry(target_map_key(bucket_key, key))
            .or_insert_with(|| Arc::new(ProfilerTarget::new(bucket_key, key)))
            .clone();

        Some(target.open_hit(
            bucket_key,
            key,
            title,
            global_index,
            open_hits_at_open,
            SystemTime::now(),
            self.inner.machine.snapshot(),
        ))
    }

    /// Closes a hit opened by [`Profiler::begin`] and feeds it to the active
    /// collector. Consuming `hit` by value makes a double-`end` a compile
    /// error rather than a runtime race, which is stricter than the
    /// reference contract but never weaker than it.
    pub async fn end(&self, hit: Option<Hit>, postfix: &str) {
        let Some(mut hit) = hit else { return };
        let Some(target) = self.inner.targets.get(&hit.target_map_key()).map(|e| e.clone()) else {
            return;
        };

        let open_hits_at_close = self.inner.open_hits_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        let global_index_at_close = self.inner.hit_count.load(Ordering::SeqCst);
        target.close_hit(
            &mut hit,
            postfix,
            global_index_at_close,
            open_hits_at_close,
            self.inner.machine.snapshot(),
        );

        let stats = target.snapshot();
        let collector = self.collector();
        if collector.enabled() && collector.bucket_enabled(&hit.bucket_key) {
            collector.feed(stats, hit).await;
        }
    }

    /// Out-of-band log line for a bucket, bypassing the hit lifecycle.
    pub async fn log(&self, bucket_key: &str, text: &str) {
        if validate_bucket_key(bucket_key).is_err() {
            return;
        }
        if !self.enabled(Some(bucket_key)) {
            return;
        }
        self.collector().log(bucket_key, text).await;
    }

    /// Drains the active collector; `stop_logging` permanently disables it
    /// afterward (used on process shutdown).
    pub async fn flush(&self, stop_logging: bool) {
        self.collector().flush(stop_logging).await;
    }

    pub fn hit_count(&self) -> u64 {
        self.inner.hit_count.load(Ordering::SeqCst)
    }

    pub fn open_hits_count(&self) -> u64 {
        self.inner.open_hits_count.load(Ordering::SeqCst)
    }

    /// Snapshot every target currently tracked, for the table formatter.
    pub fn target_snapshots(&self) -> Vec<crate::profiling::target::Stats> {
        self.inner
            .targets
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::local::LocalCollector;

    #[tokio::test]
    async fn begin_without_collector_returns_none() {
        let profiler = Profiler::new();
        assert!(profiler.begin("bucket", "key", "t").is_none());
    }

    #[tokio::test]
    async fn begin_end_roundtrip_feeds_collector() {
        let profiler = Profiler::new();
        let collector = Arc::new(LocalCollector::new(Default::default()));
        profiler.set_collector(collector.clone());

        let hit = profiler.begin("bucket", "key", "title");
        assert!(hit.is_some());
        assert_eq!(profiler.open_hits_count(), 1);
        profiler.end(hit, "").await;
        assert_eq!(profiler.open_hits_count(), 0);

        let stats = profiler.target_snapshots();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 1);
    }

    #[tokio::test]
    async fn header_bucket_key_never_opens_a_hit() {
        let profiler = Profiler::new();
        let collector = Arc::new(LocalCollector::new(Default::default()));
        profiler.set_collector(collector);
        assert!(profiler.begin("header", "key", "t").is_none());
    }
}
