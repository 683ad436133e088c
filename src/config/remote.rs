//! Remote counterpart of [`super::local::RuntimeConfigurator`]: tracks the
//! same flat map, but it is pushed by `HttpProxyCollector`'s feed responses
//! (and pulled out-of-band via `POST /conf`) instead of read from disk.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::{ChangeSource, ChangeTimes, ConfigChange, ConfigValue, ConfigurationRecord};

struct State {
    enabled: bool,
    values: ConfigurationRecord,
    ctimes: ChangeTimes,
}

#[derive(Debug, Clone)]
pub struct RemoteRuntimeConfiguratorConfig {
    pub uri: String,
    pub remote_config_polling_interval: Duration,
}

/// Holds the client-side view of remote configuration state; driven entirely
/// by [`RemoteRuntimeConfigurator::apply_delta`] and
/// [`RemoteRuntimeConfigurator::set_enabled`] called from the collector that
/// owns the actual HTTP transport (`HttpProxyCollector`).
pub struct RemoteRuntimeConfigurator {
    config: RemoteRuntimeConfiguratorConfig,
    state: RwLock<State>,
    change_tx: broadcast::Sender<ConfigChange>,
    polling: std::sync::atomic::AtomicBool,
}

impl RemoteRuntimeConfigurator {
    pub fn new(config: RemoteRuntimeConfiguratorConfig) -> Arc<Self> {
        let (change_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            state: RwLock::new(State {
                enabled: true,
                values: ConfigurationRecord::new(),
                ctimes: ChangeTimes::default(),
            }),
            change_tx,
            polling: std::sync::atomic::AtomicBool::new(false),
        })
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

    /// Applies a `deltaConfig` object from a `/feed` or `/conf` response:
    /// `{ key: { value, oldValue } }`.
    pub fn apply_delta(&self, ctimes: ChangeTimes, delta: serde_json::Map<String, serde_json::Value>) {
        let mut state = self.state.write();
        for (key, entry) in delta {
            let value = entry.get("value").and_then(json_to_config_value);
            let old_value = entry.get("oldValue").and_then(json_to_config_value);

            match &value {
                Some(v) => {
                    state.values.insert(key.clone(), v.clone());
                }
                None => {
                    state.values.remove(&key);
                }
            }

            // "enabled" is a recognized config path as well as a dedicated
            // field here -- a delta that flips it also flips the dedicated
            // flag the polling loop watches.
            if key == "enabled" {
                if let Some(ConfigValue::Bool(b)) = value {
                    state.enabled = b;
                }
            }

            let _ = self.change_tx.send(ConfigChange {
                path: key,
                value,
                old_value,
                source: ChangeSource::Remote,
                ctimes,
            });
        }
        state.ctimes = ctimes;
    }

    /// Flips `enabled` when the aggregator's `/e` responds `200`, or a feed
    /// response otherwise reports it active again.
    pub fn set_enabled(&self, enabled: bool) {
        self.state.write().enabled = enabled;
    }

    /// Starts (if not already running) a background poll of `<uri>/e`,
    /// exiting as soon as it observes the aggregator enabled again.
    pub fn start_polling_if_disabled(self: &Arc<Self>, client: reqwest::Client) {
        if self.enabled() {
            return;
        }
        if self
            .polling
            .compare_exchange(false, true, std::sync::atomic::Ordering::SeqCst, std::sync::atomic::Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let this = self.clone();
        let url = format!("{}/e", this.config.uri.trim_end_matches('/'));
        let interval = this.config.remote_config_polling_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match client.get(&url).send().await {
                    Ok(response) if response.status().as_u16() == 200 => {
                        this.set_enabled(true);
                        break;
                    }
                    Ok(response) if response.status().as_u16() == 204 => {
                        // still disabled, keep polling
                    }
                    _ => {
                        // transient failure; back off is the caller's
                        // failureTimeoutMs via the shared HttpProxyCollector
                    }
                }
                if this.enabled() {
                    break;
                }
            }
            this.polling.store(false, std::sync::atomic::Ordering::SeqCst);
        });
    }
}

fn json_to_config_value(value: &serde_json::Value) -> Option<ConfigValue> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(ConfigValue::Number),
        serde_json::Value::String(s) => Some(ConfigValue::String(s.clone())),
        serde_json::Value::Bool(b) => Some(ConfigValue::Bool(*b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configurator() -> Arc<RemoteRuntimeConfigurator> {
        RemoteRuntimeConfigurator::new(RemoteRuntimeConfiguratorConfig {
            uri: "http://example.invalid".to_string(),
            remote_config_polling_interval: Duration::from_millis(50),
        })
    }

    #[test]
    fn apply_delta_updates_snapshot_and_ctimes() {
        let configurator = configurator();
        let mut delta = serde_json::Map::new();
        delta.insert(
            "a".to_string(),
            serde_json::json!({ "value": 1, "oldValue": null }),
        );
        let ctimes = ChangeTimes {
            command_file_ctime: Some(10),
            config_file_ctime: Some(20),
        };
        configurator.apply_delta(ctimes, delta);

        assert_eq!(configurator.snapshot().get("a"), Some(&ConfigValue::Number(1.0)));
        assert_eq!(configurator.ctimes(), ctimes);
    }

    #[test]
    fn missing_value_removes_key() {
        let configurator = configurator();
        let mut first = serde_json::Map::new();
        first.insert("a".to_string(), serde_json::json!({ "value": 1 }));
        configurator.apply_delta(ChangeTimes::default(), first);
        assert!(configurator.snapshot().contains_key("a"));

        let mut second = serde_json::Map::new();
        second.insert("a".to_string(), serde_json::json!({ "value": null, "oldValue": 1 }));
        configurator.apply_delta(ChangeTimes::default(), second);
        assert!(!configurator.snapshot().contains_key("a"));
    }
}
