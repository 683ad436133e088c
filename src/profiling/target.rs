//! Incremental per-`bucket*key` timing aggregate.
//!
//! Mirrors the running-average idiom in `cpu_profiler.rs`'s `HotspotTracker`
//! (`total / call_count`), but keeps the aggregate as a true running mean
//! (`avg += (sample - avg) / count`) so a target with an unbounded hit count
//! never needs to replay its whole history to answer `avgNs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::machine::MachineSnapshot;
use crate::profiling::hit::{Hit, HitExecStats, HitMachineStats};

/// Point-in-time view of a target's aggregate, as shown in a table row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub bucket_key: String,
    pub key: String,
    pub hit_count: u64,
    pub count: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub max_at: Option<SystemTime>,
    pub avg_ns: f64,
    pub total_ms: u64,
    pub avg_cpu: f64,
    pub min_avg_os_cpu: f64,
    pub max_avg_os_cpu: f64,
    pub avg_avg_os_cpu: f64,
}

impl Stats {
    /// `hitCount - count`: hits opened but never closed (crash, leaked hit,
    /// or a disabled bucket swallowing the matching `end`).
    pub fn discrepancy(&self) -> i64 {
        self.hit_count as i64 - self.count as i64
    }
}

struct Inner {
    count: u64,
    min_ns: u64,
    max_ns: u64,
    max_at: Option<SystemTime>,
    avg_ns: f64,
    total_ms: u64,
    avg_cpu: f64,
    min_avg_os_cpu: f64,
    max_avg_os_cpu: f64,
    avg_avg_os_cpu: f64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            count: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            max_at: None,
            avg_ns: 0.0,
            total_ms: 0,
            avg_cpu: 0.0,
            min_avg_os_cpu: 100.0,
            max_avg_os_cpu: 0.0,
            avg_avg_os_cpu: 0.0,
        }
    }
}

/// The aggregate for one `bucket*key`. `hit_count` is a lock-free counter
/// incremented on every open, since opens can race closes arbitrarily;
/// everything that only changes on close lives behind `inner`.
pub struct ProfilerTarget {
    bucket_key: String,
    key: String,
    hit_count: AtomicU64,
    inner: Mutex<Inner>,
}

impl ProfilerTarget {
    pub fn new(bucket_key: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket_key: bucket_key.into(),
            key: key.into(),
            hit_count: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Records an open and returns the new in-flight [`Hit`]. `global_index`
    /// and `open_hits_at_open` come from the owning `Profiler`'s process-wide
    /// counters, not this target's own.
    #[allow(clippy::too_many_arguments)]
    pub fn open_hit(
        &self,
        bucket_key: &str,
        key: &str,
        title: impl Into<String>,
        global_index: u64,
        open_hits_at_open: u64,
        opened_at: SystemTime,
        start_snapshot: MachineSnapshot,
    ) -> Hit {
        let local_index = self.hit_count.fetch_add(1, Ordering::SeqCst) + 1;
        Hit {
            index: global_index,
            local_index,
            open_hits_at_open,
            bucket_key: bucket_key.to_string(),
            key: key.to_string(),
            title: title.into(),
            opened_at,
            open_hr: Instant::now(),
            start_snapshot,
            exec_stats: None,
            machine_stats: None,
        }
    }

    /// Closes `hit` in place, appending `postfix` to its title and filling in
    /// its exec/machine stats, and folds the hit into this target's running
    /// aggregate.
    pub fn close_hit(
        &self,
        hit: &mut Hit,
        postfix: &str,
        global_index_at_close: u64,
        open_hits_at_close: u64,
        end_snapshot: MachineSnapshot,
    ) {
        if !postfix.is_empty() {
            hit.title.push_str(postfix);
        }

        let duration_ns = hit.open_hr.elapsed().as_nanos() as u64;
        let os1min_cpu = end_snapshot.os_cpu_avg_1min.max(0.0);
        let machine_stats = HitMachineStats::compute(&hit.start_snapshot, &end_snapshot, duration_ns);
        let max_cpu_percent = machine_stats.max_cpu_percent;

        let mut inner = self.inner.lock();
        inner.count += 1;
        let count = inner.count;

        if duration_ns < inner.min_ns {
            inner.min_ns = duration_ns;
        }
        if duration_ns > inner.max_ns {
            inner.max_ns = duration_ns;
            inner.max_at = Some(SystemTime::now());
        }
        inner.avg_ns += (duration_ns as f64 - inner.avg_ns) / count as f64;
        inner.total_ms += (duration_ns as f64 / 1_000_000.0).round() as u64;
        inner.avg_cpu += (max_cpu_percent - inner.avg_cpu) / count as f64;

        if os1min_cpu < inner.min_avg_os_cpu {
            inner.min_avg_os_cpu = os1min_cpu;
        }
        if os1min_cpu > inner.max_avg_os_cpu {
            inner.max_avg_os_cpu = os1min_cpu;
        }
        inner.avg_avg_os_cpu += (os1min_cpu - inner.avg_avg_os_cpu) / count as f64;
        drop(inner);

        hit.exec_stats = Some(HitExecStats {
            to_local_index: hit.local_index,
            local_index_to: self.hit_count.load(Ordering::SeqCst),
            delta_local_index: self.hit_count.load(Ordering::SeqCst) as i64 - hit.local_index as i64,
            to_global_index: hit.index,
            global_index_to: global_index_at_close,
            delta_global_index: global_index_at_close as i64 - hit.index as i64,
            to_open: hit.open_hits_at_open,
            open_to: open_hits_at_close,
            delta_open: open_hits_at_close as i64 - hit.open_hits_at_open as i64,
            duration_ns,
        });
        hit.machine_stats = Some(machine_stats);
    }

    pub fn bucket_key(&self) -> &str {
        &self.bucket_key
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn snapshot(&self) -> Stats {
        let inner = self.inner.lock();
        Stats {
            bucket_key: self.bucket_key.clone(),
            key: self.key.clone(),
            hit_count: self.hit_count.load(Ordering::SeqCst),
            count: inner.count,
            min_ns: if inner.count == 0 { 0 } else { inner.min_ns },
            max_ns: inner.max_ns,
            max_at: inner.max_at,
            avg_ns: inner.avg_ns,
            total_ms: inner.total_ms,
            avg_cpu: inner.avg_cpu,
            min_avg_os_cpu: if inner.count == 0 { 0.0 } else { inner.min_avg_os_cpu },
            max_avg_os_cpu: inner.max_avg_os_cpu,
            avg_avg_os_cpu: inner.avg_avg_os_cpu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineSnapshot;
    use proptest::prelude::*;

    fn snap(cpu: f64) -> MachineSnapshot {
        MachineSnapshot {
            os_cpu_avg_1min: cpu,
            ..Default::default()
        }
    }

    #[test]
    fn discrepancy_tracks_unclosed_hits() {
        let target = ProfilerTarget::new("b", "k");
        let _hit1 = target.open_hit("b", "k", "a", 1, 0, SystemTime::now(), snap(1.0));
        let mut hit2 = target.open_hit("b", "k", "b", 2, 1, SystemTime::now(), snap(1.0));
        target.close_hit(&mut hit2, "", 2, 0, snap(1.0));

        let stats = target.snapshot();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.discrepancy(), 1);
    }

    #[test]
    fn running_average_matches_simple_mean() {
        let target = ProfilerTarget::new("b", "k");
        for cpu in [10.0, 20.0, 30.0] {
            let mut hit = target.open_hit("b", "k", "t", 1, 0, SystemTime::now(), snap(cpu));
            target.close_hit(&mut hit, "", 1, 0, snap(cpu));
        }
        let stats = target.snapshot();
        assert_eq!(stats.count, 3);
        assert!((stats.avg_avg_os_cpu - 20.0).abs() < 1e-9);
        assert_eq!(stats.min_avg_os_cpu, 10.0);
        assert_eq!(stats.max_avg_os_cpu, 30.0);
    }

    #[test]
    fn min_ns_is_zero_with_no_closes() {
        let target = ProfilerTarget::new("b", "k");
        assert_eq!(target.snapshot().min_ns, 0);
    }

    proptest! {
        /// Feeding N hits whose only varying input is the CPU sample at
        /// close time should leave `min/max/avg_avg_os_cpu` equal to the
        /// min/max/mean computed offline over the same sample sequence,
        /// regardless of order or how many samples there are.
        #[test]
        fn running_cpu_aggregates_match_offline_moments(samples in prop::collection::vec(0.0f64..100.0, 1..64)) {
            let target = ProfilerTarget::new("b", "k");
            for &cpu in &samples {
                let mut hit = target.open_hit("b", "k", "t", 1, 0, SystemTime::now(), snap(cpu));
                target.close_hit(&mut hit, "", 1, 0, snap(cpu));
            }
            let stats = target.snapshot();

            let expected_min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
            let expected_max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let expected_mean = samples.iter().sum::<f64>() / samples.len() as f64;

            prop_assert_eq!(stats.count, samples.len() as u64);
            prop_assert_eq!(stats.min_avg_os_cpu, expected_min);
            prop_assert_eq!(stats.max_avg_os_cpu, expected_max);
            prop_assert!((stats.avg_avg_os_cpu - expected_mean).abs() < 1e-6);
            prop_assert!(stats.min_avg_os_cpu <= stats.avg_avg_os_cpu + 1e-9);
            prop_assert!(stats.avg_avg_os_cpu <= stats.max_avg_os_cpu + 1e-9);
        }
    }
}
