//! Prints hits/log lines to stdout, colorized the way `ConsoleOutput` in
//! `logging/mod.rs` does.

use async_trait::async_trait;
use chrono::Local;

use crate::collector::{format, Verbosity};
use crate::logger::Logger;
use crate::profiling::hit::Hit;
use crate::profiling::target::Stats;

pub struct ConsoleLogger {
    use_color: bool,
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self { use_color: true }
    }
}

impl ConsoleLogger {
    pub fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn paint(&self, text: &str) -> String {
        if self.use_color {
            format!("\x1b[36m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }
}

#[async_trait]
impl Logger for ConsoleLogger {
    async fn log_hit(&self, stats: &Stats, table: &[Stats], hit: &Hit, verbosity: Verbosity) {
        let body = match verbosity {
            Verbosity::Log => format::format_log(hit),
            Verbosity::Brief => format::format_brief(std::slice::from_ref(stats), hit),
            Verbosity::Full => format::format_full(table, hit),
        };
        println!("{} [{}] {}", Local::now().format("%H:%M:%S%.3f"), self.paint(&hit.bucket_key), body);
    }

    async fn log_text(&self, bucket_key: &str, text: &str) {
        println!("{} [{}] {}", Local::now().format("%H:%M:%S%.3f"), self.paint(bucket_key), text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[tokio::test]
    async fn logging_a_hit_does_not_panic() {
        let logger = ConsoleLogger::new(false);
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
        logger.log_hit(&Stats::default(), &[Stats::default()], &hit, Verbosity::Log).await;
        logger.log_text("b", "hello").await;
    }
}
