//! Machine-wide and process-wide resource sampling shared by every hit.
//!
//! A single background task owns a `sysinfo::System` and refreshes it every
//! five seconds; callers take a cheap clone of the latest [`MachineSnapshot`]
//! rather than touching `sysinfo` themselves. `Profiler::begin`/`end` stamp
//! each [`crate::profiling::hit::Hit`] with one of these on open and close.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuExt, PidExt, ProcessExt, System, SystemExt};
use tokio::time::interval;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const HISTORY_CAP: usize = 15 * 60 / 5 + 4; // enough samples for a 15-minute rolling window

/// Per-CPU busy/idle tick counters (cumulative, monotonic within one run).
///
/// Modeled after `/proc/stat`-style cumulative counters (see the teacher's
/// `monitoring/system/linux.rs` `CpuStats`): two hits' snapshots are diffed
/// to get a `busyDifference`/idle-difference pair for the window between
/// them, rather than reading an instantaneous percentage that would only
/// describe the sampler's own 5s tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CpuCounter {
    pub busy_micros: u64,
    pub idle_micros: u64,
}

/// Snapshot of process and OS resource usage taken at a point in time.
///
/// Stamped onto a [`crate::profiling::hit::Hit`] at open and close; the
/// difference between the two stamps is what a verbose report shows per hit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub taken_at: Option<SystemTime>,
    pub process_uptime_ms: u64,
    pub process_cpu_user_micros: u64,
    pub process_cpu_system_micros: u64,
    pub heap_used_bytes: u64,
    pub heap_total_bytes: u64,
    pub os_uptime_ms: u64,
    pub os_cpu_avg_1min: f64,
    pub os_cpu_avg_5min: f64,
    pub os_cpu_avg_15min: f64,
    pub per_cpu: Vec<CpuCounter>,
    pub os_free_memory_bytes: u64,
    pub os_total_memory_bytes: u64,
}

/// Internal smoothing windows distinct from the OS 1/5/15-min averages that
/// live on [`MachineSnapshot`] (those mirror the platform loadavg); this is
/// our own rolling mean of the process's CPU percentage, refreshed every tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingAverages {
    pub sec10: f64,
    pub min1: f64,
    pub min5: f64,
    pub min15: f64,
}

struct Sample {
    at: Instant,
    cpu_percent: f64,
}

/// Background sampler: one per process, started once and shared.
pub struct MachineSampler {
    system: RwLock<System>,
    pid: sysinfo::Pid,
    started_at: Instant,
    snapshot: RwLock<MachineSnapshot>,
    history: RwLock<VecDeque<Sample>>,
    /// Cumulative busy/idle microseconds per CPU, carried forward across
    /// ticks; `sample_once` advances these by the instantaneous usage times
    /// the elapsed wall time since the previous tick.
    cumulative_cpu: RwLock<Vec<CpuCounter>>,
    last_tick_at: RwLock<Instant>,
}

static GLOBAL: OnceCell<Arc<MachineSampler>> = OnceCell::new();

impl MachineSampler {
    fn new() -> Arc<Self> {
        let mut system = System::new();
        system.refresh_all();
        let pid = sysinfo::get_current_pid().unwrap_or_else(|_| sysinfo::Pid::from(0));

        Arc::new(Self {
            system: RwLock::new(system),
            pid,
            started_at: Instant::now(),
            snapshot: RwLock::new(MachineSnapshot::default()),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAP)),
            cumulative_cpu: RwLock::new(Vec::new()),
            last_tick_at: RwLock::new(Instant::now()),
        })
    }

    /// Process-wide singleton, started lazily on first access.
    pub fn global() -> Arc<MachineSampler> {
        GLOBAL
            .get_or_init(|| {
                let sampler = Self::new();
                sampler.clone().spawn();
                sampler
            })
            .clone()
    }

    fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = interval(SAMPLE_INTERVAL);
            loop {
                tick.tick().await;
                self.sample_once();
            }
        });
    }

    fn sample_once(&self) {
        let mut system = self.system.write();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_process(self.pid);

        let now = Instant::now();
        let elapsed_micros = {
            let mut last_tick = self.last_tick_at.write();
            let dt = now.duration_since(*last_tick).as_micros() as u64;
            *last_tick = now;
            dt
        };

        let cpus = system.cpus();
        let mut cumulative = self.cumulative_cpu.write();
        if cumulative.len() != cpus.len() {
            cumulative.resize(cpus.len(), CpuCounter::default());
        }
        let mut per_cpu = Vec::with_capacity(cpus.len());
        let mut instant_percent_sum = 0.0f64;
        for (counter, cpu) in cumulative.iter_mut().zip(cpus.iter()) {
            let instant_percent = cpu.cpu_usage() as f64;
            instant_percent_sum += instant_percent;
            let busy_delta = ((instant_percent / 100.0) * elapsed_micros as f64).round() as u64;
            let idle_delta = elapsed_micros.saturating_sub(busy_delta);
            counter.busy_micros = counter.busy_micros.saturating_add(busy_delta);
            counter.idle_micros = counter.idle_micros.saturating_add(idle_delta);
            per_cpu.push(*counter);
        }
        let os_cpu_avg = if per_cpu.is_empty() {
            0.0
        } else {
            instant_percent_sum / per_cpu.len() as f64
        };

        let load = system.load_average();
        let (proc_uptime_ms, cpu_user_micros, cpu_system_micros, heap_used) =
            match system.process(self.pid) {
                Some(process) => (
                    self.started_at.elapsed().as_millis() as u64,
                    (process.cpu_usage() as u64).saturating_mul(1000),
                    0,
                    process.memory().saturating_mul(1024),
                ),
                None => (self.started_at.elapsed().as_millis() as u64, 0, 0, 0),
            };

        let snapshot = MachineSnapshot {
            taken_at: Some(SystemTime::now()),
            process_uptime_ms: proc_uptime_ms,
            process_cpu_user_micros: cpu_user_micros,
            process_cpu_system_micros: cpu_system_micros,
            heap_used_bytes: heap_used,
            heap_total_bytes: system.total_memory().saturating_mul(1024),
            os_uptime_ms: system.uptime().saturating_mul(1000),
            os_cpu_avg_1min: load.one,
            os_cpu_avg_5min: load.five,
            os_cpu_avg_15min: load.fifteen,
            per_cpu,
            os_free_memory_bytes: system.free_memory().saturating_mul(1024),
            os_total_memory_bytes: system.total_memory().saturating_mul(1024),
        };
        *self.snapshot.write() = snapshot;

        let mut history = self.history.write();
        history.push_back(Sample {
            at: Instant::now(),
            cpu_percent: os_cpu_avg,
        });
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }

    /// Cheap clone of the most recent snapshot; call at hit open and close.
    pub fn snapshot(&self) -> MachineSnapshot {
        self.snapshot.read().clone()
    }

    /// Internal rolling means over 10s/1m/5m/15m windows, used for smoothing
    /// damped decisions (e.g. failure backoff) that want recent trend rather
    /// than an instantaneous sample.
    pub fn rolling_averages(&self) -> RollingAverages {
        let now = Instant::now();
        let history = self.history.read();
        let mean_over = |window: Duration| -> f64 {
            let (sum, count) = history
                .iter()
                .rev()
                .take_while(|s| now.duration_since(s.at) <= window)
                .fold((0.0, 0usize), |(sum, count), s| (sum + s.cpu_percent, count + 1));
            if count == 0 {
                0.0
            } else {
                sum / count as f64
            }
        };
        RollingAverages {
            sec10: mean_over(Duration::from_secs(10)),
            min1: mean_over(Duration::from_secs(60)),
            min5: mean_over(Duration::from_secs(5 * 60)),
            min15: mean_over(Duration::from_secs(15 * 60)),
        }
    }
}

pub fn unix_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_is_available_immediately() {
        let sampler = MachineSampler::new();
        sampler.sample_once();
        let snap = sampler.snapshot();
        assert!(snap.taken_at.is_some());
        assert!(snap.os_total_memory_bytes >= snap.os_free_memory_bytes || snap.os_total_memory_bytes == 0);
    }

    #[tokio::test]
    async fn rolling_averages_start_at_zero() {
        let sampler = MachineSampler::new();
        let rolling = sampler.rolling_averages();
        assert_eq!(rolling.sec10, 0.0);
        assert_eq!(rolling.min15, 0.0);
    }
}
