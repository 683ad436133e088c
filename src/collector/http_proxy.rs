//! Ships hits and log lines to a remote `AggregatorServer` over HTTP.
//!
//! Grounded in `services/consensus/http.rs`'s `reqwest`/axum client idiom,
//! generalized from a one-shot request-response call to a
//! failure-rate-damped push loop (`failureCounter`/`failureTimeoutMs`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::collector::Collector;
use crate::config::remote::RemoteRuntimeConfigurator;
use crate::config::{ChangeTimes, ConfigurationRecord};
use crate::profiling::hit::Hit;
use crate::profiling::target::Stats;

#[derive(Debug, Clone)]
pub struct HttpProxyCollectorConfig {
    pub uri: String,
    pub source_key: String,
    pub request_timeout: Duration,
    pub failure_timeout: Duration,
}

impl Default for HttpProxyCollectorConfig {
    fn default() -> Self {
        Self {
            uri: "http://127.0.0.1:8080".to_string(),
            source_key: String::new(),
            request_timeout: Duration::from_secs(5),
            failure_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    target_stats: Option<&'a Stats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hit: Option<SerializableHit<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<i64>,
    source_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cts: Option<(Option<i64>, Option<i64>)>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SerializableHit<'a> {
    index: u64,
    local_index: u64,
    bucket_key: &'a str,
    key: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    exec_stats: Option<&'a crate::profiling::hit::HitExecStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    machine_stats: Option<&'a crate::profiling::hit::HitMachineStats>,
}

impl<'a> From<&'a Hit> for SerializableHit<'a> {
    fn from(hit: &'a Hit) -> Self {
        Self {
            index: hit.index,
            local_index: hit.local_index,
            bucket_key: &hit.bucket_key,
            key: &hit.key,
            title: &hit.title,
            exec_stats: hit.exec_stats.as_ref(),
            machine_stats: hit.machine_stats.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedResponse {
    ctimes: (Option<i64>, Option<i64>),
    #[serde(default)]
    delta_config: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    current_config: Option<ConfigurationRecord>,
}

struct FailureState {
    counter: u64,
    since: Option<Instant>,
}

pub struct HttpProxyCollector {
    config: HttpProxyCollectorConfig,
    client: reqwest::Client,
    failure: Mutex<FailureState>,
    on_delta: Arc<dyn Fn(ChangeTimes, Option<serde_json::Map<String, serde_json::Value>>) + Send + Sync>,
    remote_configurator: Option<Arc<RemoteRuntimeConfigurator>>,
}

impl HttpProxyCollector {
    pub fn new(config: HttpProxyCollectorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            failure: Mutex::new(FailureState {
                counter: 0,
                since: None,
            }),
            on_delta: Arc::new(|_, _| {}),
            remote_configurator: None,
        }
    }

    pub fn with_delta_handler(
        mut self,
        handler: impl Fn(ChangeTimes, Option<serde_json::Map<String, serde_json::Value>>) + Send + Sync + 'static,
    ) -> Self {
        self.on_delta = Arc::new(handler);
        self
    }

    /// Attaches a [`RemoteRuntimeConfigurator`]: switches this collector into
    /// "remote-config mode" -- every feed carries `cts` so the
    /// aggregator can compute a delta, and a successful response's delta is
    /// applied straight to the configurator instead of (or in addition to)
    /// any handler set via [`Self::with_delta_handler`].
    pub fn with_remote_configurator(mut self, configurator: Arc<RemoteRuntimeConfigurator>) -> Self {
        self.remote_configurator = Some(configurator);
        self
    }

    fn cts(&self) -> Option<(Option<i64>, Option<i64>)> {
        self.remote_configurator.as_ref().map(|c| {
            let ctimes = c.ctimes();
            (ctimes.command_file_ctime, ctimes.config_file_ctime)
        })
    }

    fn record_failure(&self) {
        let mut failure = self.failure.lock();
        failure.counter += 1;
        let now = Instant::now();
        let should_report = match failure.since {
            None => {
                failure.since = Some(now);
                false
            }
            Some(since) => now.duration_since(since) >= self.config.failure_timeout,
        };
        if should_report {
            tracing::warn!(
                "{} feed(s) lost shipping to {} over {:?}",
                failure.counter,
                self.config.uri,
                self.config.failure_timeout
            );
            failure.counter = 0;
            failure.since = Some(now);
        }
    }

    fn record_success(&self) {
        let mut failure = self.failure.lock();
        if failure.counter > 0 {
            tracing::info!("resuming normal operation shipping to {}", self.config.uri);
        }
        failure.counter = 0;
        failure.since = None;
    }

    async fn post_feed(&self, body: FeedBody<'_>) {
        let url = format!("{}/feed", self.config.uri.trim_end_matches('/'));
        let result = self.client.post(&url).json(&body).send().await;

        match result {
            Ok(response) if response.status().as_u16() == 204 => {
                self.record_success();
            }
            Ok(response) if response.status().is_success() => {
                match response.json::<FeedResponse>().await {
                    Ok(parsed) => {
                        self.record_success();
                        let ctimes = ChangeTimes {
                            command_file_ctime: parsed.ctimes.0,
                            config_file_ctime: parsed.ctimes.1,
                        };
                        if let Some(configurator) = &self.remote_configurator {
                            if let Some(delta) = parsed.delta_config.clone() {
                                configurator.apply_delta(ctimes, delta);
                            }
                            if !configurator.enabled() {
                                configurator.start_polling_if_disabled(self.client.clone());
                            }
                        }
                        (self.on_delta)(ctimes, parsed.delta_config);
                    }
                    Err(_) => self.record_failure(),
                }
            }
            _ => self.record_failure(),
        }
    }
}

#[async_trait]
impl Collector for HttpProxyCollector {
    /// In remote-config mode this mirrors the attached
    /// [`RemoteRuntimeConfigurator`]'s `enabled` flag, so `/e` polling
    /// (spec §4.7) actually stops the `Profiler` from feeding while the
    /// aggregator reports itself disabled. Outside remote-config mode the
    /// transport has no local notion of disablement, so it stays `true`.
    fn enabled(&self) -> bool {
        self.remote_configurator.as_ref().map(|c| c.enabled()).unwrap_or(true)
    }

    fn bucket_enabled(&self, _bucket_key: &str) -> bool {
        true
    }

    async fn feed(&self, stats: Stats, hit: Hit) {
        let body = FeedBody {
            target_stats: Some(&stats),
            hit: Some(SerializableHit::from(&hit)),
            bucket_key: None,
            text: None,
            time: None,
            source_key: &self.config.source_key,
            cts: self.cts(),
        };
        self.post_feed(body).await;
    }

    async fn log(&self, bucket_key: &str, text: &str) {
        let body = FeedBody {
            target_stats: None,
            hit: None,
            bucket_key: Some(bucket_key),
            text: Some(text),
            time: Some(crate::machine::unix_millis(std::time::SystemTime::now())),
            source_key: &self.config.source_key,
            cts: self.cts(),
        };
        self.post_feed(body).await;
    }

    /// The transport is non-durable; an in-flight request on shutdown is not
    /// awaited, so flush is deliberately a no-op.
    async fn flush(&self, _stop_logging: bool) {}
}

impl HttpProxyCollector {
    /// Out-of-band `POST /conf`, used by a [`RemoteRuntimeConfigurator`] to
    /// pull the latest delta when no feed is currently flowing.
    /// A no-op when this collector isn't in remote-config mode.
    pub async fn pull_config(&self) {
        let Some(cts) = self.cts() else { return };
        let url = format!("{}/conf", self.config.uri.trim_end_matches('/'));
        let result = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "cts": [cts.0, cts.1] }))
            .send()
            .await;

        let Ok(response) = result else {
            self.record_failure();
            return;
        };
        if !response.status().is_success() {
            self.record_failure();
            return;
        }
        match response.json::<FeedResponse>().await {
            Ok(parsed) => {
                self.record_success();
                let ctimes = ChangeTimes {
                    command_file_ctime: parsed.ctimes.0,
                    config_file_ctime: parsed.ctimes.1,
                };
                if let (Some(configurator), Some(delta)) = (&self.remote_configurator, parsed.delta_config) {
                    configurator.apply_delta(ctimes, delta);
                }
            }
            Err(_) => self.record_failure(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_counter_increments_without_reporting_before_timeout() {
        let collector = HttpProxyCollector::new(HttpProxyCollectorConfig {
            failure_timeout: Duration::from_secs(3600),
            ..Default::default()
        });
        collector.record_failure();
        collector.record_failure();
        assert_eq!(collector.failure.lock().counter, 2);
    }

    #[test]
    fn success_resets_failure_state() {
        let collector = HttpProxyCollector::new(HttpProxyCollectorConfig::default());
        collector.record_failure();
        collector.record_success();
        assert_eq!(collector.failure.lock().counter, 0);
    }

    #[test]
    fn enabled_without_remote_configurator_is_always_true() {
        let collector = HttpProxyCollector::new(HttpProxyCollectorConfig::default());
        assert!(collector.enabled());
    }

    #[test]
    fn enabled_mirrors_remote_configurator_toggle() {
        let configurator = crate::config::remote::RemoteRuntimeConfigurator::new(
            crate::config::remote::RemoteRuntimeConfiguratorConfig {
                uri: "http://example.invalid".to_string(),
                remote_config_polling_interval: Duration::from_secs(60),
            },
        );
        let collector =
            HttpProxyCollector::new(HttpProxyCollectorConfig::default()).with_remote_configurator(configurator.clone());

        assert!(collector.enabled());
        configurator.set_enabled(false);
        assert!(!collector.enabled());
        configurator.set_enabled(true);
        assert!(collector.enabled());
    }
}
