//! Logger trait: turns a closed hit or a log line into output text.
//!
//! Grounded in `logging/mod.rs`'s `LogOutput` trait (`write`/`flush`
//! async-trait), generalized from one fixed log-entry shape to the
//! three-verbosity (`log`/`brief`/`full`) table rows a bucket can ask for.

pub mod console;
pub mod file;

use async_trait::async_trait;

use crate::collector::Verbosity;
use crate::profiling::hit::Hit;
use crate::profiling::target::Stats;

#[async_trait]
pub trait Logger: Send + Sync {
    /// `table` is every target currently known for `hit.bucket_key`, already
    /// sorted descending by that bucket's configured sort column; `stats`
    /// is `hit`'s own target, already present in `table` as one of its
    /// rows.
    async fn log_hit(&self, stats: &Stats, table: &[Stats], hit: &Hit, verbosity: Verbosity);
    async fn log_text(&self, bucket_key: &str, text: &str);
}
