//! Plain-text table rendering for a bucket's targets, at `log`/`brief`/`full`
//! verbosity. Column set and header row mirror the reserved `"header"`
//! bucket key (a bucket configured under that name would collide with this).

use chrono::{DateTime, Local};

use crate::collector::{SortColumn, Verbosity};
use crate::machine::MachineSnapshot;
use crate::profiling::hit::{Hit, HitExecStats, HitMachineStats};
use crate::profiling::target::Stats;

const COLUMNS: &[&str] = &[
    "key", "count", "discr", "minMs", "avgMs", "maxMs", "totalSec", "maxDateTime", "avgCpu", "minOsCpu", "avgOsCpu",
    "maxOsCpu",
];

/// Sorts `rows` descending by `column`; on an unparseable/unsupported
/// request falls back to the identity order (column index 0, i.e. no-op)
/// rather than panicking, matching the `SortError` contract of "report and
/// keep serving the last-known-good view."
pub fn sort_rows(rows: &mut [Stats], column: SortColumn) {
    rows.sort_by(|a, b| {
        let key = |s: &Stats| -> f64 {
            match column {
                SortColumn::Count => s.count as f64,
                SortColumn::Discrepancy => s.discrepancy() as f64,
                SortColumn::MinMs => s.min_ns as f64 / 1_000_000.0,
                SortColumn::AvgMs => s.avg_ns / 1_000_000.0,
                SortColumn::MaxMs => s.max_ns as f64 / 1_000_000.0,
                SortColumn::TotalSec => s.total_ms as f64 / 1000.0,
                SortColumn::TotalMs => s.total_ms as f64,
                SortColumn::AvgCpu => s.avg_cpu,
                SortColumn::MinAvgOsCpu => s.min_avg_os_cpu,
                SortColumn::AvgAvgOsCpu => s.avg_avg_os_cpu,
                SortColumn::MaxAvgOsCpu => s.max_avg_os_cpu,
            }
        };
        key(b).partial_cmp(&key(a)).unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn header_line() -> String {
    format!(" \t{}", COLUMNS.join("\t"))
}

/// One table row. `current_key`, when it matches `stats.key`, draws the `>`
/// marker for "the current hit's row"; a positive discrepancy draws `!!!`
/// regardless of which row is current.
fn row_line(stats: &Stats, current_key: Option<&str>) -> String {
    let marker = if current_key == Some(stats.key.as_str()) { ">" } else { " " };
    let flag = if stats.discrepancy() > 0 { "!!!" } else { "" };
    let max_at = match stats.max_at {
        Some(t) => DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => "-".to_string(),
    };
    format!(
        "{marker}{flag}\t{}\t{}\t{}\t{:.3}\t{:.3}\t{:.3}\t{:.1}\t{}\t{:.1}\t{:.1}\t{:.1}\t{:.1}",
        stats.key,
        stats.count,
        stats.discrepancy(),
        stats.min_ns as f64 / 1_000_000.0,
        stats.avg_ns / 1_000_000.0,
        stats.max_ns as f64 / 1_000_000.0,
        stats.total_ms as f64 / 1000.0,
        max_at,
        stats.avg_cpu,
        stats.min_avg_os_cpu,
        stats.avg_avg_os_cpu,
        stats.max_avg_os_cpu,
    )
}

/// One line summarizing machine-wide resource usage at the time of a hit
/// (the panel a `brief`/`full` report prints above its hit-stats sub-row).
fn machine_panel_line(snapshot: &MachineSnapshot) -> String {
    format!(
        "    cpuUser={:.1}ms cpuSys={:.1}ms heap={}/{}B os1/5/15={:.2}/{:.2}/{:.2} mem free/total={}/{}B",
        snapshot.process_cpu_user_micros as f64 / 1000.0,
        snapshot.process_cpu_system_micros as f64 / 1000.0,
        snapshot.heap_used_bytes,
        snapshot.heap_total_bytes,
        snapshot.os_cpu_avg_1min,
        snapshot.os_cpu_avg_5min,
        snapshot.os_cpu_avg_15min,
        snapshot.os_free_memory_bytes,
        snapshot.os_total_memory_bytes,
    )
}

/// Machine-stats panel plus, when the hit has closed, its hit-stats
/// sub-row — the common header both `brief` and `full` print above their
/// table rows (§4.3).
fn hit_header_block(hit: &Hit) -> String {
    let snapshot = hit.machine_stats.as_ref().map(|m| &m.end).unwrap_or(&hit.start_snapshot);
    let mut out = machine_panel_line(snapshot);
    if let (Some(exec), Some(machine)) = (&hit.exec_stats, &hit.machine_stats) {
        out.push('\n');
        out.push_str(&sub_row_line(exec, machine));
    }
    out
}

fn sub_row_line(exec: &HitExecStats, machine: &HitMachineStats) -> String {
    format!(
        "    deltaLN={} ->LN={} LN->={} deltaN={} ->N={} N->={} deltaOpen={} ->open={} open->={} duration={:.3}ms cpu%(k/u/max)={:.1}/{:.1}/{:.1} heapDelta={}B",
        exec.delta_local_index,
        exec.to_local_index,
        exec.local_index_to,
        exec.delta_global_index,
        exec.to_global_index,
        exec.global_index_to,
        exec.delta_open,
        exec.to_open,
        exec.open_to,
        exec.duration_ns as f64 / 1_000_000.0,
        machine.kernel_cpu_percent,
        machine.user_cpu_percent,
        machine.max_cpu_percent,
        machine.heap_delta_bytes,
    )
}

/// One terse line per hit: `"<wall clock> [<bucket>] <key> - <title>"`.
/// The bucket tag and wall clock are added by the caller (the `Logger`
/// knows the timestamp and bucket; this just supplies the key/title part).
pub fn format_log(hit: &Hit) -> String {
    format!("{} - {}", hit.key, hit.title)
}

/// Machine-stats panel + hit-stats sub-row + header + the single current
/// row of `rows` matching `hit.key`, for `Verbosity::Brief` (§4.3). If no
/// row in `rows` matches `hit.key`, the table body is omitted.
pub fn format_brief(rows: &[Stats], hit: &Hit) -> String {
    let mut out = hit_header_block(hit);
    out.push('\n');
    out.push_str(&header_line());
    if let Some(stats) = rows.iter().find(|s| s.key == hit.key) {
        out.push('\n');
        out.push_str(&row_line(stats, Some(&hit.key)));
    }
    out
}

/// Machine-stats panel + hit-stats sub-row + header + full bucket table
/// (every known key, sorted), for `Verbosity::Full` (§4.3).
pub fn format_full(rows: &[Stats], hit: &Hit) -> String {
    let mut out = hit_header_block(hit);
    out.push('\n');
    out.push_str(&header_line());
    for stats in rows {
        out.push('\n');
        out.push_str(&row_line(stats, Some(&hit.key)));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::{Instant, SystemTime};

    use super::*;

    fn stats(key: &str, avg_ms: f64) -> Stats {
        Stats {
            bucket_key: "b".into(),
            key: key.into(),
            hit_count: 1,
            count: 1,
            avg_ns: avg_ms * 1_000_000.0,
            ..Default::default()
        }
    }

    fn sample_hit(key: &str) -> Hit {
        Hit {
            index: 1,
            local_index: 1,
            open_hits_at_open: 0,
            bucket_key: "b".into(),
            key: key.into(),
            title: "t".into(),
            opened_at: SystemTime::now(),
            open_hr: Instant::now(),
            start_snapshot: MachineSnapshot::default(),
            exec_stats: None,
            machine_stats: None,
        }
    }

    #[test]
    fn sort_descending_by_avg_ms() {
        let mut rows = vec![stats("a", 1.0), stats("b", 5.0), stats("c", 3.0)];
        sort_rows(&mut rows, SortColumn::AvgMs);
        let keys: Vec<&str> = rows.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
    }

    #[test]
    fn brief_contains_panel_header_and_current_row_only() {
        let rows = vec![stats("a", 1.0), stats("b", 2.0)];
        let hit = sample_hit("b");
        let table = format_brief(&rows, &hit);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].contains("cpuUser"));
        assert!(lines[1].contains("key"));
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("\tb\t"));
    }

    #[test]
    fn brief_omits_row_when_key_absent_from_table() {
        let rows = vec![stats("a", 1.0)];
        let hit = sample_hit("missing");
        let table = format_brief(&rows, &hit);
        assert_eq!(table.lines().count(), 2);
    }

    #[test]
    fn full_contains_panel_header_and_every_row() {
        let rows = vec![stats("a", 1.0), stats("b", 2.0)];
        let hit = sample_hit("b");
        let table = format_full(&rows, &hit);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].contains("cpuUser"));
        assert!(lines[1].contains("key"));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn current_row_is_marked_and_discrepancy_flagged() {
        let mut rows = vec![stats("a", 1.0), stats("b", 2.0)];
        rows[1].hit_count = 2; // count stays 1 -> discrepancy 1
        let hit = sample_hit("b");
        let table = format_full(&rows, &hit);
        let b_line = table.lines().find(|l| l.contains('\t') && l.contains("\tb\t")).unwrap();
        assert!(b_line.starts_with('>'));
        assert!(b_line.contains("!!!"));
        let a_line = table.lines().find(|l| l.contains("\ta\t")).unwrap();
        assert!(a_line.starts_with(' '));
    }

    #[test]
    fn max_at_renders_dash_when_never_set() {
        let table = row_line(&stats("a", 1.0), None);
        assert!(table.contains("\t-\t"));
    }
}
