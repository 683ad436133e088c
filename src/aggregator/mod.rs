//! HTTP aggregation endpoint: hosts one [`LocalCollector`] per
//! feed source, serves `/feed`, `/conf`, `/e`, and answers every client with
//! a configuration delta computed against that client's remembered clock.
//!
//! Grounded in `services/consensus/http.rs`'s axum `Router`/`AppState`
//! idiom, generalized from a fixed route table over one service to a
//! dynamically-grown `source key -> LocalCollector` map (`dashmap`, the
//! same choice used for similar per-peer state in `wasm/host_functions.rs`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::collector::local::{LocalCollector, LocalCollectorConfig};
use crate::collector::Collector;
use crate::config::local::{RuntimeConfigurator, RuntimeConfiguratorConfig};
use crate::config::{ChangeSource, ChangeTimes, ConfigValue, ConfigurationRecord};
use crate::error::Result;
use crate::logger::file::{FileLogger, FileLoggerConfig};
use crate::profiling::hit::{Hit, HitExecStats, HitMachineStats};
use crate::profiling::target::Stats;

/// 31 MiB.
pub const MAX_BODY_BYTES: usize = 31 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AggregatorServerConfig {
    pub bind_address: SocketAddr,
    pub log_path: PathBuf,
    pub archive_path: PathBuf,
    pub max_log_size_bytes: u64,
    pub max_archive_size_bytes: u64,
    pub log_request_archiving_modulo: u64,
    pub flush_delay: Duration,
    pub command_file_path: PathBuf,
    pub configuration_file_path: PathBuf,
    pub refresh_silence_timeout: Duration,
}

impl Default for AggregatorServerConfig {
    fn default() -> Self {
        Self {
            bind_address: ([0, 0, 0, 0], 9666).into(),
            log_path: PathBuf::from("__pflogs"),
            archive_path: PathBuf::from("__pfarchive"),
            max_log_size_bytes: 0,
            max_archive_size_bytes: 0,
            log_request_archiving_modulo: 100,
            flush_delay: Duration::from_millis(0),
            command_file_path: PathBuf::from("__pfenable"),
            configuration_file_path: PathBuf::from("__pfconfig"),
            refresh_silence_timeout: Duration::from_millis(5000),
        }
    }
}

/// One entry of the server's configuration cache: the value last observed
/// for a dotted path, alongside the ctimes of the refresh that produced it.
/// Delta responses are computed by filtering this map against a client's
/// remembered `cts`.
#[derive(Debug, Clone)]
struct ConfigCacheEntry {
    ctimes: ChangeTimes,
    #[allow(dead_code)]
    source: ChangeSource,
    value: Option<ConfigValue>,
    old_value: Option<ConfigValue>,
}

/// Derives the per-feed source key from a peer address and an optional
/// client-supplied `sourceKey`, sanitizing both halves. A caller may swap
/// this out via [`AggregatorServer::with_source_extractor`].
pub type SourceExtractor = Arc<dyn Fn(SocketAddr, Option<&str>) -> String + Send + Sync>;

pub fn default_source_extractor(peer: SocketAddr, source_key: Option<&str>) -> String {
    let ip = sanitize_ip(&peer.ip().to_string());
    match source_key {
        Some(key) if !key.is_empty() => format!("{ip}-{}", sanitize_source_key(key)),
        _ => ip,
    }
}

fn sanitize_ip(ip: &str) -> String {
    ip.chars().map(|c| if c.is_ascii_digit() { c } else { '.' }).collect()
}

fn sanitize_source_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect()
}

/// Hosts per-source [`LocalCollector`]s, answers `/feed`, `/conf`, `/e`, and
/// maintains the configuration delta protocol against each client's clock.
pub struct AggregatorServer {
    config: AggregatorServerConfig,
    collectors: DashMap<String, Arc<LocalCollector>>,
    configurator: Arc<RuntimeConfigurator>,
    configuration_cache: DashMap<String, ConfigCacheEntry>,
    aggregate_ctimes: RwLock<ChangeTimes>,
    source_extractor: RwLock<SourceExtractor>,
}

impl AggregatorServer {
    pub fn new(config: AggregatorServerConfig) -> Arc<Self> {
        let configurator = Arc::new(RuntimeConfigurator::new(RuntimeConfiguratorConfig {
            command_file_path: config.command_file_path.clone(),
            configuration_file_path: config.configuration_file_path.clone(),
            refresh_silence_timeout: config.refresh_silence_timeout,
        }));

        let server = Arc::new(Self {
            config,
            collectors: DashMap::new(),
            configurator,
            configuration_cache: DashMap::new(),
            aggregate_ctimes: RwLock::new(ChangeTimes::default()),
            source_extractor: RwLock::new(Arc::new(default_source_extractor)),
        });
        server.clone().spawn_config_watcher();
        server
    }

    pub fn with_source_extractor(self: Arc<Self>, extractor: SourceExtractor) -> Arc<Self> {
        *self.source_extractor.write() = extractor;
        self
    }

    fn spawn_config_watcher(self: Arc<Self>) {
        let mut changes = self.configurator.subscribe();
        tokio::spawn(async move {
            loop {
                let refresh_interval = self.config.refresh_silence_timeout.max(Duration::from_millis(250));
                tokio::select! {
                    change = changes.recv() => {
                        match change {
                            Ok(change) => self.absorb_change(change),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = tokio::time::sleep(refresh_interval) => {
                        let _ = self.configurator.async_smart_refresh().await;
                    }
                }
            }
        });
    }

    fn absorb_change(&self, change: crate::config::ConfigChange) {
        self.configuration_cache.insert(
            change.path,
            ConfigCacheEntry {
                ctimes: change.ctimes,
                source: change.source,
                value: change.value,
                old_value: change.old_value,
            },
        );
        let mut aggregate = self.aggregate_ctimes.write();
        aggregate.command_file_ctime = max_opt(aggregate.command_file_ctime, change.ctimes.command_file_ctime);
        aggregate.config_file_ctime = max_opt(aggregate.config_file_ctime, change.ctimes.config_file_ctime);
    }

    fn enabled(&self) -> bool {
        self.configurator.enabled()
    }

    fn aggregate_ctimes(&self) -> ChangeTimes {
        *self.aggregate_ctimes.read()
    }

    fn current_config(&self) -> ConfigurationRecord {
        self.configurator.snapshot()
    }

    /// Delta for a client remembering `client_cts`: every cached key whose
    /// ctimes are newer than the client's on either axis.
    fn compute_delta(&self, client_cts: ChangeTimes) -> Option<serde_json::Map<String, serde_json::Value>> {
        let mut delta = serde_json::Map::new();
        for entry in self.configuration_cache.iter() {
            let cache_entry = entry.value();
            if client_cts.is_behind(&cache_entry.ctimes) {
                delta.insert(
                    entry.key().clone(),
                    serde_json::json!({
                        "value": config_value_to_json(cache_entry.value.as_ref()),
                        "oldValue": config_value_to_json(cache_entry.old_value.as_ref()),
                    }),
                );
            }
        }
        if delta.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    fn collector_for(&self, source_key: &str) -> Arc<LocalCollector> {
        if let Some(existing) = self.collectors.get(source_key) {
            return existing.clone();
        }
        let collector = Arc::new(LocalCollector::new(LocalCollectorConfig {
            enabled: true,
            flush_delay: self.config.flush_delay,
            buckets: Default::default(),
        }));
        let logger = Arc::new(FileLogger::new(
            source_key,
            FileLoggerConfig {
                log_path: self.config.log_path.clone(),
                archive_path: self.config.archive_path.clone(),
                max_log_size_bytes: self.config.max_log_size_bytes,
                log_request_archiving_modulo: self.config.log_request_archiving_modulo,
                max_archive_size_bytes: self.config.max_archive_size_bytes,
            },
        ));
        // The file logger is bucket-agnostic internally (it derives the
        // per-bucket filenames itself), so it becomes this collector's
        // fallback for every bucket this source ever feeds.
        collector.set_default_logger(logger);
        self.collectors.entry(source_key.to_string()).or_insert(collector).clone()
    }

    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr = self.config.bind_address;
        let app = self.clone().router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("aggregator listening on {addr}");
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/feed", post(handle_feed))
            .route("/conf", post(handle_conf))
            .route("/e", get(handle_enabled))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(self)
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

fn config_value_to_json(value: Option<&ConfigValue>) -> serde_json::Value {
    match value {
        None => serde_json::Value::Null,
        Some(ConfigValue::Number(n)) => serde_json::json!(n),
        Some(ConfigValue::String(s)) => serde_json::json!(s),
        Some(ConfigValue::Bool(b)) => serde_json::json!(b),
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("aggregator received shutdown signal");
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHit {
    index: u64,
    local_index: u64,
    bucket_key: String,
    key: String,
    title: String,
    #[serde(default)]
    exec_stats: Option<HitExecStats>,
    #[serde(default)]
    machine_stats: Option<HitMachineStats>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedRequest {
    #[serde(default)]
    target_stats: Option<Stats>,
    #[serde(default)]
    hit: Option<WireHit>,
    #[serde(default)]
    bucket_key: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    source_key: Option<String>,
    #[serde(default)]
    cts: Option<(Option<i64>, Option<i64>)>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedAndConfResponse {
    ctimes: (Option<i64>, Option<i64>),
    #[serde(skip_serializing_if = "Option::is_none")]
    delta_config: Option<serde_json::Map<String, serde_json::Value>>,
    current_config: ConfigurationRecord,
}

#[derive(Debug, Deserialize)]
struct ConfRequest {
    cts: (Option<i64>, Option<i64>),
}

async fn handle_feed(
    State(server): State<Arc<AggregatorServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<FeedRequest>,
) -> Response {
    let extractor = server.source_extractor.read().clone();
    let source_key = extractor(peer, body.source_key.as_deref());
    let collector = server.collector_for(&source_key);

    if let (Some(stats), Some(wire_hit)) = (body.target_stats.clone(), body.hit) {
        let hit = Hit {
            index: wire_hit.index,
            local_index: wire_hit.local_index,
            open_hits_at_open: 0,
            bucket_key: wire_hit.bucket_key,
            key: wire_hit.key,
            title: wire_hit.title,
            opened_at: std::time::SystemTime::now(),
            open_hr: std::time::Instant::now(),
            start_snapshot: Default::default(),
            exec_stats: wire_hit.exec_stats,
            machine_stats: wire_hit.machine_stats,
        };
        collector.feed(stats, hit).await;
    } else if let Some(bucket_key) = &body.bucket_key {
        collector.log(bucket_key, body.text.as_deref().unwrap_or_default()).await;
    }

    match body.cts {
        Some((cmd, cfg)) => {
            let client_cts = ChangeTimes {
                command_file_ctime: cmd,
                config_file_ctime: cfg,
            };
            let delta = server.compute_delta(client_cts);
            match delta {
                None => StatusCode::NO_CONTENT.into_response(),
                Some(delta) => {
                    let ctimes = server.aggregate_ctimes();
                    Json(FeedAndConfResponse {
                        ctimes: (ctimes.command_file_ctime, ctimes.config_file_ctime),
                        delta_config: Some(delta),
                        current_config: server.current_config(),
                    })
                    .into_response()
                }
            }
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn handle_conf(State(server): State<Arc<AggregatorServer>>, body: Option<Json<ConfRequest>>) -> Response {
    let Some(Json(body)) = body else {
        return (StatusCode::BAD_REQUEST, "missing cts").into_response();
    };
    let client_cts = ChangeTimes {
        command_file_ctime: body.cts.0,
        config_file_ctime: body.cts.1,
    };
    let delta = server.compute_delta(client_cts);
    let ctimes = server.aggregate_ctimes();
    Json(FeedAndConfResponse {
        ctimes: (ctimes.command_file_ctime, ctimes.config_file_ctime),
        delta_config: delta,
        current_config: server.current_config(),
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct EnabledResponse {
    ctimes: (Option<i64>, Option<i64>),
}

async fn handle_enabled(State(server): State<Arc<AggregatorServer>>) -> Response {
    if !server.enabled() {
        return StatusCode::NO_CONTENT.into_response();
    }
    let ctimes = server.aggregate_ctimes();
    Json(EnabledResponse {
        ctimes: (ctimes.command_file_ctime, ctimes.config_file_ctime),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_ip_and_source_key() {
        assert_eq!(sanitize_ip("127.0.0.1"), "127.0.0.1");
        assert_eq!(sanitize_ip("::1"), "..1");
        assert_eq!(sanitize_source_key("a b/c"), "a-b-c");
    }

    #[test]
    fn default_extractor_combines_ip_and_source_key() {
        let peer: SocketAddr = "10.0.0.5:1234".parse().unwrap();
        assert_eq!(default_source_extractor(peer, None), "10.0.0.5");
        assert_eq!(default_source_extractor(peer, Some("app one")), "10.0.0.5-app-one");
    }

    #[tokio::test]
    async fn compute_delta_is_none_when_client_is_current() {
        let server = AggregatorServer::new(AggregatorServerConfig {
            bind_address: ([127, 0, 0, 1], 0).into(),
            ..Default::default()
        });
        server.absorb_change(crate::config::ConfigChange {
            path: "enabled".into(),
            value: Some(ConfigValue::Bool(true)),
            old_value: None,
            source: ChangeSource::ConfigFile,
            ctimes: ChangeTimes {
                command_file_ctime: Some(10),
                config_file_ctime: Some(10),
            },
        });

        let current = server.aggregate_ctimes();
        assert!(server.compute_delta(current).is_none());

        let stale = ChangeTimes::default();
        assert!(server.compute_delta(stale).is_some());
    }
}
