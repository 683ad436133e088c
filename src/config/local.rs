//! Polls a sentinel "command" file and a JSON config file for changes and
//! emits [`ConfigChange`] events, throttled so bursts of filesystem activity
//! collapse into a single refresh.
//!
//! Grounded in `config/runtime_reload.rs`'s `RuntimeConfigManager`: a
//! `tokio::sync::Mutex<()>` re-entrancy guard (`reload_lock`), a
//! last-modified map compared against fresh `stat` results, and a
//! `broadcast::Sender` fanning changes out to subscribers.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::config::{escape_segment, flatten_json, ChangeSource, ChangeTimes, ConfigChange, ConfigurationRecord};
use crate::error::{Error, Result};
use crate::machine::unix_millis;

#[derive(Debug, Clone)]
pub struct RuntimeConfiguratorConfig {
    pub command_file_path: PathBuf,
    pub configuration_file_path: PathBuf,
    pub refresh_silence_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshOutcome {
    pub has_changed: bool,
    pub ctimes: ChangeTimes,
}

struct State {
    enabled: bool,
    values: ConfigurationRecord,
    config_file_mtime: Option<SystemTime>,
    ctimes: ChangeTimes,
}

/// Local (file-based) runtime configuration source. `async_smart_refresh`
/// is the sole entry point; everything else is observation.
pub struct RuntimeConfigurator {
    config: RuntimeConfiguratorConfig,
    state: SyncRwLock<State>,
    reload_lock: AsyncMutex<()>,
    last_refresh: SyncRwLock<Option<Instant>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

impl RuntimeConfigurator {
    pub fn new(config: RuntimeConfiguratorConfig) -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            config,
            state: SyncRwLock::new(State {
                enabled: false,
                values: ConfigurationRecord::new(),
                config_file_mtime: None,
                ctimes: ChangeTimes::default(),
            }),
            reload_lock: AsyncMutex::new(()),
            last_refresh: SyncRwLock::new(None),
            change_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn snapshot(&self) -> ConfigurationRecord {
        self.state.read().values.clone()
    }

    pub fn ctimes(&self) -> ChangeTimes {
        self.state.read().ctimes
    }

    /// Throttled, re-entrancy-collapsing refresh. Concurrent callers during
    /// an in-flight refresh get `has_changed: false` immediately rather than
    /// queueing -- the in-flight refresh already reflects the freshest state
    /// any of them could have observed.
    pub async fn async_smart_refresh(&self) -> Result<RefreshOutcome> {
        let Ok(_guard) = self.reload_lock.try_lock() else {
            return Ok(RefreshOutcome {
                has_changed: false,
                ctimes: self.ctimes(),
            });
        };

        if let Some(last) = *self.last_refresh.read() {
            if last.elapsed() < self.config.refresh_silence_timeout {
                return Ok(RefreshOutcome {
                    has_changed: false,
                    ctimes: self.ctimes(),
                });
            }
        }

        let outcome = self.do_refresh().await?;
        *self.last_refresh.write() = Some(Instant::now());
        Ok(outcome)
    }

    async fn do_refresh(&self) -> Result<RefreshOutcome> {
        let mut has_changed = false;

        let command_meta = tokio::fs::metadata(&self.config.command_file_path).await;
        let (now_enabled, command_ctime) = match command_meta {
            Ok(meta) => (true, meta.modified().ok().map(unix_millis)),
            Err(_) => (false, None),
        };

        let config_meta = tokio::fs::metadata(&self.config.configuration_file_path).await;
        let (config_mtime, config_ctime) = match &config_meta {
            Ok(meta) => (meta.modified().ok(), meta.modified().ok().map(unix_millis)),
            Err(_) => (None, None),
        };

        let previous_mtime = self.state.read().config_file_mtime;
        let unchanged_on_disk = match (previous_mtime, config_mtime) {
            (Some(prev), Some(curr)) => prev == curr,
            (None, None) => true,
            _ => false,
        };

        let new_values = if config_meta.is_err() {
            ConfigurationRecord::new()
        } else if unchanged_on_disk {
            self.state.read().values.clone()
        } else {
            let contents = tokio::fs::read_to_string(&self.config.configuration_file_path)
                .await
                .map_err(|e| Error::ConfigIo(e.to_string()))?;
            let json: serde_json::Value = serde_json::from_str(&contents).map_err(|e| Error::ConfigParse(e.to_string()))?;
            flatten_json(&json)
        };

        let ctimes = ChangeTimes {
            command_file_ctime: command_ctime,
            config_file_ctime: config_ctime,
        };

        if !unchanged_on_disk {
            let previous_values = self.state.read().values.clone();
            for (path, value, old_value) in crate::config::diff(&previous_values, &new_values) {
                has_changed = true;
                let _ = self.change_tx.send(ConfigChange {
                    path,
                    value,
                    old_value,
                    source: ChangeSource::ConfigFile,
                    ctimes,
                });
            }
        }

        let was_enabled = self.state.read().enabled;
        if was_enabled != now_enabled {
            has_changed = true;
            let _ = self.change_tx.send(ConfigChange {
                path: "enabled".to_string(),
                value: Some(crate::config::ConfigValue::Bool(now_enabled)),
                old_value: Some(crate::config::ConfigValue::Bool(was_enabled)),
                source: ChangeSource::CommandFile,
                ctimes,
            });
        }

        {
            let mut state = self.state.write();
            state.enabled = now_enabled;
            state.values = new_values;
            state.config_file_mtime = config_mtime;
            state.ctimes = ctimes;
        }

        Ok(RefreshOutcome { has_changed, ctimes })
    }
}

/// Round-trips a dotted path's segments back out for diagnostics; not used
/// on the hot path but kept alongside `escape_segment` since the two rules
/// must always agree.
pub fn unescape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                out.push(next);
                chars.next();
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn configurator(dir: &TempDir) -> RuntimeConfigurator {
        RuntimeConfigurator::new(RuntimeConfiguratorConfig {
            command_file_path: dir.path().join("enabled.cmd"),
            configuration_file_path: dir.path().join("config.json"),
            refresh_silence_timeout: Duration::from_millis(0),
        })
    }

    #[tokio::test]
    async fn disabled_when_command_file_absent() {
        let dir = TempDir::new().unwrap();
        let configurator = configurator(&dir);
        let outcome = configurator.async_smart_refresh().await.unwrap();
        assert!(!configurator.enabled());
        assert!(!outcome.has_changed);
    }

    #[tokio::test]
    async fn sentinel_presence_enables_and_emits_change() {
        let dir = TempDir::new().unwrap();
        let configurator = configurator(&dir);
        tokio::fs::write(&configurator.config.command_file_path, b"").await.unwrap();

        let outcome = configurator.async_smart_refresh().await.unwrap();
        assert!(configurator.enabled());
        assert!(outcome.has_changed);
    }

    #[tokio::test]
    async fn config_file_changes_are_diffed() {
        let dir = TempDir::new().unwrap();
        let configurator = configurator(&dir);
        tokio::fs::write(&configurator.config.command_file_path, b"").await.unwrap();
        tokio::fs::write(&configurator.config.configuration_file_path, br#"{"a":1}"#)
            .await
            .unwrap();

        configurator.async_smart_refresh().await.unwrap();
        assert_eq!(
            configurator.snapshot().get("a"),
            Some(&crate::config::ConfigValue::Number(1.0))
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::fs::write(&configurator.config.configuration_file_path, br#"{"a":2}"#)
            .await
            .unwrap();
        let outcome = configurator.async_smart_refresh().await.unwrap();
        assert!(outcome.has_changed);
        assert_eq!(
            configurator.snapshot().get("a"),
            Some(&crate::config::ConfigValue::Number(2.0))
        );
    }

    #[test]
    fn unescape_reverses_escape() {
        assert_eq!(unescape_segment(&escape_segment("a.b\\c")), "a.b\\c");
    }
}
