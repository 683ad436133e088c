//! In-process collector: batches hits/log lines and hands them to a
//! [`crate::logger::Logger`] after a short coalescing delay.
//!
//! The state machine and single-consumer worker loop is grounded in
//! `logging/mod.rs`'s `ProductionLogger` (a queue of outputs drained by one
//! async task) and `config/runtime_reload.rs`'s background-task idiom
//! (`tokio::spawn` loop gated by a shared flag, `tokio::sync::Mutex` guarding
//! re-entrancy).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Notify;
use tokio::time::Duration;

use crate::collector::{format, BucketConfig, Collector, RESERVED_BUCKET_KEY};
use crate::logger::Logger;
use crate::profiling::hit::{target_map_key, Hit};
use crate::profiling::target::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Waiting,
    Flushing,
    Disabled,
}

enum QueueItem {
    Hit { stats: Stats, table: Vec<Stats>, hit: Hit },
    Log { bucket_key: String, text: String },
}

#[derive(Debug, Clone)]
pub struct LocalCollectorConfig {
    pub enabled: bool,
    pub flush_delay: Duration,
    pub buckets: std::collections::HashMap<String, BucketConfig>,
}

impl Default for LocalCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_delay: Duration::from_millis(1000),
            buckets: std::collections::HashMap::new(),
        }
    }
}

struct Shared {
    queue: SyncMutex<VecDeque<QueueItem>>,
    state: SyncMutex<State>,
    wake: Notify,
    loggers: DashMap<String, Arc<dyn Logger>>,
    default_logger: SyncMutex<Arc<dyn Logger>>,
    buckets: DashMap<String, BucketConfig>,
    /// Latest `Stats` seen for every `(bucket,key)`, keyed by
    /// [`target_map_key`]; source of the sorted per-bucket table a `brief`/
    /// `full` report shows.
    target_stats: DashMap<String, Stats>,
    flush_delay: Duration,
    worker_started: AtomicBool,
}

/// Collects hits/log lines in-process, coalescing a burst of feeds into one
/// flush after `flush_delay` of quiet, and writes them out through the
/// configured [`Logger`] per bucket (falling back to a no-op default).
pub struct LocalCollector {
    shared: Arc<Shared>,
}

impl LocalCollector {
    pub fn new(config: LocalCollectorConfig) -> Self {
        let buckets = DashMap::new();
        for (key, cfg) in config.buckets {
            buckets.insert(key, cfg);
        }
        let shared = Arc::new(Shared {
            queue: SyncMutex::new(VecDeque::new()),
            state: SyncMutex::new(if config.enabled { State::Idle } else { State::Disabled }),
            wake: Notify::new(),
            loggers: DashMap::new(),
            default_logger: SyncMutex::new(Arc::new(crate::logger::console::ConsoleLogger::default())),
            buckets,
            target_stats: DashMap::new(),
            flush_delay: config.flush_delay,
            worker_started: AtomicBool::new(false),
        });
        Self { shared }
    }

    /// Projects and sorts every target currently known for `bucket_key`,
    /// using that bucket's configured sort column (default `maxMs`).
    fn bucket_table(&self, bucket_key: &str) -> Vec<Stats> {
        let mut rows: Vec<Stats> = self
            .shared
            .target_stats
            .iter()
            .filter(|entry| entry.value().bucket_key == bucket_key)
            .map(|entry| entry.value().clone())
            .collect();
        let sort_column = self
            .shared
            .buckets
            .get(bucket_key)
            .map(|cfg| cfg.sort_column)
            .unwrap_or_default();
        format::sort_rows(&mut rows, sort_column);
        rows
    }

    pub fn set_bucket_logger(&self, bucket_key: &str, logger: Arc<dyn Logger>) {
        self.shared.loggers.insert(bucket_key.to_string(), logger);
    }

    /// Replaces the fallback logger used for any bucket with no logger
    /// registered via [`Self::set_bucket_logger`] (the default is a
    /// [`crate::logger::console::ConsoleLogger`]).
    pub fn set_default_logger(&self, logger: Arc<dyn Logger>) {
        *self.shared.default_logger.lock() = logger;
    }

    pub fn set_bucket_config(&self, bucket_key: &str, config: BucketConfig) {
        self.shared.buckets.insert(bucket_key.to_string(), config);
    }

    pub fn state(&self) -> State {
        *self.shared.state.lock()
    }

    fn enqueue(&self, item: QueueItem) {
        if self.state() == State::Disabled {
            return;
        }
        self.shared.queue.lock().push_back(item);
        self.ensure_worker();
        self.shared.wake.notify_one();

        let mut state = self.shared.state.lock();
        if *state == State::Idle {
            *state = State::Waiting;
        }
    }

    fn ensure_worker(&self) {
        if self
            .shared
            .worker_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let shared = self.shared.clone();
            tokio::spawn(async move { worker_loop(shared).await });
        }
    }

}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        shared.wake.notified().await;
        tokio::time::sleep(shared.flush_delay).await;

        loop {
            let more = !shared.queue.lock().is_empty();
            if !more {
                break;
            }
            *shared.state.lock() = State::Flushing;
            drain_once(&shared).await;
            tokio::task::yield_now().await;
        }

        let mut state = shared.state.lock();
        if *state != State::Disabled {
            *state = State::Idle;
        }
    }
}

async fn drain_once(shared: &Arc<Shared>) {
    // FIFO: pop everything queued at this instant, in order, before yielding
    // back to the scheduler (new feeds arriving mid-drain go to the next
    // round rather than interleaving with this one).
    let batch: Vec<QueueItem> = {
        let mut queue = shared.queue.lock();
        queue.drain(..).collect()
    };

    for item in batch {
        match item {
            QueueItem::Hit { stats, table, hit } => {
                let logger = shared
                    .loggers
                    .get(&stats.bucket_key)
                    .map(|e| e.value().clone())
                    .unwrap_or_else(|| shared.default_logger.clone());
                let verbosity = shared
                    .buckets
                    .get(&stats.bucket_key)
                    .map(|e| e.verbosity)
                    .unwrap_or_default();
                logger.log_hit(&stats, &table, &hit, verbosity).await;
            }
            QueueItem::Log { bucket_key, text } => {
                let logger = shared
                    .loggers
                    .get(&bucket_key)
                    .map(|e| e.value().clone())
                    .unwrap_or_else(|| shared.default_logger.clone());
                logger.log_text(&bucket_key, &text).await;
            }
        }
    }
}

#[async_trait]
impl Collector for LocalCollector {
    fn enabled(&self) -> bool {
        self.state() != State::Disabled
    }

    fn bucket_enabled(&self, bucket_key: &str) -> bool {
        if bucket_key == RESERVED_BUCKET_KEY {
            return false;
        }
        self.shared
            .buckets
            .get(bucket_key)
            .map(|e| e.enabled)
            .unwrap_or(true)
    }

    async fn feed(&self, stats: Stats, hit: Hit) {
        if self.state() == State::Disabled || !self.bucket_enabled(&stats.bucket_key) {
            return;
        }
        self.shared
            .target_stats
            .insert(target_map_key(&stats.bucket_key, &stats.key), stats.clone());
        let table = self.bucket_table(&stats.bucket_key);
        self.enqueue(QueueItem::Hit { stats, table, hit });
    }

    async fn log(&self, bucket_key: &str, text: &str) {
        if self.state() == State::Disabled || !self.bucket_enabled(bucket_key) {
            return;
        }
        self.enqueue(QueueItem::Log {
            bucket_key: bucket_key.to_string(),
            text: text.to_string(),
        });
    }

    async fn flush(&self, stop_logging: bool) {
        // Flush is a direct, synchronous drain regardless of the worker's
        // own coalescing delay; a disabled collector's flush is a no-op.
        if self.state() == State::Disabled {
            return;
        }
        *self.shared.state.lock() = State::Flushing;
        drain_once(&self.shared).await;

        let mut state = self.shared.state.lock();
        *state = if stop_logging { State::Disabled } else { State::Idle };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[tokio::test]
    async fn disabled_collector_drops_feeds() {
        let mut config = LocalCollectorConfig::default();
        config.enabled = false;
        let collector = LocalCollector::new(config);
        assert_eq!(collector.state(), State::Disabled);
        assert!(!collector.enabled());
    }

    #[tokio::test]
    async fn reserved_bucket_is_never_enabled() {
        let collector = LocalCollector::new(LocalCollectorConfig::default());
        assert!(!collector.bucket_enabled(RESERVED_BUCKET_KEY));
    }

    #[tokio::test]
    async fn flush_drains_and_can_stop_logging() {
        let collector = LocalCollector::new(LocalCollectorConfig {
            flush_delay: Duration::from_millis(5),
            ..Default::default()
        });
        let hit = Hit {
            index: 1,
            local_index: 1,
            open_hits_at_open: 0,
            bucket_key: "b".into(),
            key: "k".into(),
            title: "t".into(),
            opened_at: SystemTime::now(),
            open_hr: std::time::Instant::now(),
            start_snapshot: Default::default(),
            exec_stats: None,
            machine_stats: None,
        };
        collector.feed(Stats::default(), hit).await;
        collector.flush(true).await;
        assert_eq!(collector.state(), State::Disabled);
        assert!(!collector.enabled());
    }

    fn hit(bucket_key: &str) -> Hit {
        Hit {
            index: 1,
            local_index: 1,
            open_hits_at_open: 0,
            bucket_key: bucket_key.into(),
            key: "k".into(),
            title: "t".into(),
            opened_at: SystemTime::now(),
            open_hr: std::time::Instant::now(),
            start_snapshot: Default::default(),
            exec_stats: None,
            machine_stats: None,
        }
    }

    #[tokio::test]
    async fn feed_for_disabled_bucket_is_dropped() {
        let collector = LocalCollector::new(LocalCollectorConfig {
            flush_delay: Duration::from_millis(1),
            ..Default::default()
        });
        collector.set_bucket_config(
            "b",
            BucketConfig {
                enabled: false,
                ..Default::default()
            },
        );

        collector.feed(
            Stats {
                bucket_key: "b".into(),
                key: "k".into(),
                ..Default::default()
            },
            hit("b"),
        )
        .await;

        assert!(collector.shared.target_stats.is_empty());
        assert!(collector.shared.queue.lock().is_empty());
    }

    #[tokio::test]
    async fn log_for_disabled_bucket_is_dropped() {
        let collector = LocalCollector::new(LocalCollectorConfig::default());
        collector.set_bucket_config(
            "b",
            BucketConfig {
                enabled: false,
                ..Default::default()
            },
        );
        collector.log("b", "hello").await;
        assert!(collector.shared.queue.lock().is_empty());
    }
}
