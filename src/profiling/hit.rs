//! A single open/close timing event recorded against one target.

use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::machine::MachineSnapshot;

/// Per-hit timing delta computed at close, named after the sub-row columns
/// a verbose report prints under each target (`deltaLN`, `->LN`, `LN->`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitExecStats {
    /// Local (per-target) ordinal recorded when this hit was opened.
    pub to_local_index: u64,
    /// Target's local ordinal counter observed at close.
    pub local_index_to: u64,
    pub delta_local_index: i64,

    /// Global hit ordinal recorded when this hit was opened.
    pub to_global_index: u64,
    /// Global hit counter observed at close.
    pub global_index_to: u64,
    pub delta_global_index: i64,

    /// Process-wide open-hit count recorded when this hit was opened.
    pub to_open: u64,
    /// Process-wide open-hit count observed at close.
    pub open_to: u64,
    pub delta_open: i64,

    pub duration_ns: u64,
}

/// Machine-resource delta between a hit's open and close snapshots (spec
/// §4.1: "derive per-hit machine stats (kernel/user CPU% over elapsed,
/// per-CPU utilization, max CPU, heap delta)").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitMachineStats {
    pub kernel_cpu_percent: f64,
    pub user_cpu_percent: f64,
    /// Per-CPU utilization over the hit's lifetime, one entry per CPU
    /// tracked by the machine sampler, in the same order as
    /// `MachineSnapshot::per_cpu`.
    pub per_cpu_percent: Vec<f64>,
    /// The maximum entry in `per_cpu_percent`; this, not `os1min`, is what
    /// a target's `avgCpu` column aggregates (§4.1).
    pub max_cpu_percent: f64,
    pub heap_delta_bytes: i64,
    pub start: MachineSnapshot,
    pub end: MachineSnapshot,
}

impl HitMachineStats {
    /// Derives kernel/user CPU%, per-CPU utilization and its max, and the
    /// heap delta between `start` and `end`. Guards both zero-elapsed
    /// (`elapsedMicros == 0`) and zero-busy-difference-per-CPU to 0 rather
    /// than dividing by zero, per §4.1's stated edge cases.
    pub fn compute(start: &MachineSnapshot, end: &MachineSnapshot, elapsed_ns: u64) -> HitMachineStats {
        let elapsed_micros = elapsed_ns / 1_000;
        let kernel_cpu_percent = percent_of_elapsed(start.process_cpu_system_micros, end.process_cpu_system_micros, elapsed_micros);
        let user_cpu_percent = percent_of_elapsed(start.process_cpu_user_micros, end.process_cpu_user_micros, elapsed_micros);

        let per_cpu_percent: Vec<f64> = start
            .per_cpu
            .iter()
            .zip(end.per_cpu.iter())
            .map(|(s, e)| {
                let busy_difference = e.busy_micros.saturating_sub(s.busy_micros);
                let idle_difference = e.idle_micros.saturating_sub(s.idle_micros);
                let total_difference = busy_difference + idle_difference;
                if total_difference == 0 {
                    0.0
                } else {
                    busy_difference as f64 / total_difference as f64 * 100.0
                }
            })
            .collect();
        let max_cpu_percent = per_cpu_percent.iter().cloned().fold(0.0_f64, f64::max);

        let heap_delta_bytes = end.heap_used_bytes as i64 - start.heap_used_bytes as i64;

        HitMachineStats {
            kernel_cpu_percent,
            user_cpu_percent,
            per_cpu_percent,
            max_cpu_percent,
            heap_delta_bytes,
            start: start.clone(),
            end: end.clone(),
        }
    }
}

fn percent_of_elapsed(start_micros: u64, end_micros: u64, elapsed_micros: u64) -> f64 {
    if elapsed_micros == 0 {
        return 0.0;
    }
    let delta = end_micros.saturating_sub(start_micros);
    delta as f64 / elapsed_micros as f64 * 100.0
}

/// A hit in flight, or one that has just been closed.
///
/// `open_hr` is a monotonic [`Instant`] used for duration math; `opened_at`
/// is the wall-clock stamp used for anything user-facing (log lines, the
/// `maxAt` column).
#[derive(Debug, Clone)]
pub struct Hit {
    pub index: u64,
    pub local_index: u64,
    pub open_hits_at_open: u64,
    pub bucket_key: String,
    pub key: String,
    pub title: String,
    pub opened_at: SystemTime,
    pub open_hr: Instant,
    pub start_snapshot: MachineSnapshot,
    pub exec_stats: Option<HitExecStats>,
    pub machine_stats: Option<HitMachineStats>,
}

impl Hit {
    pub fn target_map_key(&self) -> String {
        target_map_key(&self.bucket_key, &self.key)
    }
}

/// Composite map key for the `bucket*key -> target` table. `*` is the
/// reserved separator; `bucket_key` must never itself contain `*`, same
/// restriction as the reserved `"header"` bucket key.
pub fn target_map_key(bucket_key: &str, key: &str) -> String {
    format!("{bucket_key}*{key}")
}
