//! Collector trait and the bucket/verbosity configuration shared by every
//! collector implementation (`local`, `http_proxy`).

pub mod format;
pub mod http_proxy;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::profiling::hit::Hit;
use crate::profiling::target::Stats;

/// Reserved grouping-dimension key; a bucket configured under this key is
/// rejected since it collides with the table formatter's header row.
pub const RESERVED_BUCKET_KEY: &str = "header";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Verbosity {
    Log,
    Brief,
    Full,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Brief
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortColumn {
    Count,
    Discrepancy,
    MinMs,
    AvgMs,
    MaxMs,
    TotalSec,
    TotalMs,
    AvgCpu,
    MinAvgOsCpu,
    AvgAvgOsCpu,
    MaxAvgOsCpu,
}

impl Default for SortColumn {
    fn default() -> Self {
        SortColumn::MaxMs
    }
}

impl SortColumn {
    pub fn parse(name: &str) -> Option<SortColumn> {
        match name {
            "count" => Some(SortColumn::Count),
            "discrepancy" => Some(SortColumn::Discrepancy),
            "minMs" => Some(SortColumn::MinMs),
            "avgMs" => Some(SortColumn::AvgMs),
            "maxMs" => Some(SortColumn::MaxMs),
            "totalSec" => Some(SortColumn::TotalSec),
            "totalMs" => Some(SortColumn::TotalMs),
            "avgCpu" => Some(SortColumn::AvgCpu),
            "minAvgOsCpu" => Some(SortColumn::MinAvgOsCpu),
            "avgAvgOsCpu" => Some(SortColumn::AvgAvgOsCpu),
            "maxAvgOsCpu" => Some(SortColumn::MaxAvgOsCpu),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    pub enabled: bool,
    pub sort_column: SortColumn,
    pub verbosity: Verbosity,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sort_column: SortColumn::default(),
            verbosity: Verbosity::default(),
        }
    }
}

/// Validates a candidate bucket key against the reserved-key rule.
pub fn validate_bucket_key(bucket_key: &str) -> crate::error::Result<()> {
    if bucket_key == RESERVED_BUCKET_KEY {
        return Err(crate::error::Error::Invariant(format!(
            "bucket key {RESERVED_BUCKET_KEY:?} is reserved for the table header row"
        )));
    }
    Ok(())
}

/// Sink a `Profiler` feeds hits and log lines to, and flushes/drains on
/// shutdown. Implementations must be total: nothing here is allowed to panic
/// or propagate past the caller's `await` (per the facade contract), so every
/// fallible step is caught internally and reported through `on_error`.
#[async_trait]
pub trait Collector: Send + Sync {
    fn enabled(&self) -> bool;

    fn bucket_enabled(&self, bucket_key: &str) -> bool;

    /// Feed one closed hit plus its target's current aggregate.
    async fn feed(&self, stats: Stats, hit: Hit);

    /// Out-of-band text line for a bucket (no associated hit).
    async fn log(&self, bucket_key: &str, text: &str);

    /// Drain whatever is queued; `stop_logging` marks the collector as
    /// terminal (no more `feed`/`log` will be honored afterward).
    async fn flush(&self, stop_logging: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bucket_key_is_rejected() {
        assert!(validate_bucket_key("header").is_err());
        assert!(validate_bucket_key("anything-else").is_ok());
    }

    #[test]
    fn sort_column_parse_roundtrips_known_names() {
        for name in [
            "count",
            "discrepancy",
            "minMs",
            "avgMs",
            "maxMs",
            "totalSec",
            "totalMs",
            "avgCpu",
            "minAvgOsCpu",
            "avgAvgOsCpu",
            "maxAvgOsCpu",
        ] {
            assert!(SortColumn::parse(name).is_some(), "{name} should parse");
        }
        assert!(SortColumn::parse("bogus").is_none());
    }
}
