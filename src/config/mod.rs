//! Flat runtime configuration: a dotted-path map of scalar leaves, fed by
//! either a local JSON file ([`local::RuntimeConfigurator`]) or deltas
//! pushed over HTTP ([`remote::RemoteRuntimeConfigurator`]).

pub mod local;
pub mod remote;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A configuration leaf: numbers, strings and booleans only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Number(f64),
    String(String),
    Bool(bool),
}

/// Flat `path -> value` map; `path` segments are escaped with
/// [`escape_segment`] and joined with `.`.
pub type ConfigurationRecord = BTreeMap<String, ConfigValue>;

/// Command-file / config-file change times, nullable (a file that doesn't
/// exist yet has no ctime).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTimes {
    pub command_file_ctime: Option<i64>,
    pub config_file_ctime: Option<i64>,
}

impl ChangeTimes {
    /// A client's remembered clock is behind `other`'s on at least one axis
    /// -- the condition an aggregator uses to decide a key belongs in a
    /// delta response (nulls on either side compare as 0).
    pub fn is_behind(&self, other: &ChangeTimes) -> bool {
        self.command_file_ctime.unwrap_or(0) < other.command_file_ctime.unwrap_or(0)
            || self.config_file_ctime.unwrap_or(0) < other.config_file_ctime.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    ConfigFile,
    CommandFile,
    Remote,
}

/// One emitted configuration change, as described by `RuntimeConfigurator`
/// and `RemoteRuntimeConfigurator` alike.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: String,
    pub value: Option<ConfigValue>,
    pub old_value: Option<ConfigValue>,
    pub source: ChangeSource,
    pub ctimes: ChangeTimes,
}

/// Escapes `.` and `\` within a single path segment so the assembled
/// dotted path round-trips unambiguously.
pub fn escape_segment(segment: &str) -> String {
    segment.replace('\\', "\\\\").replace('.', "\\.")
}

/// Depth-first flattening of a JSON object into a [`ConfigurationRecord`].
/// Arrays and non-scalar leaves are not descended into beyond this pass --
/// they simply contribute no leaves.
pub fn flatten_json(value: &JsonValue) -> ConfigurationRecord {
    let mut out = BTreeMap::new();
    let mut path = Vec::new();
    flatten_into(value, &mut path, &mut out);
    out
}

fn flatten_into(value: &JsonValue, path: &mut Vec<String>, out: &mut ConfigurationRecord) {
    match value {
        JsonValue::Object(map) => {
            for (k, v) in map {
                path.push(escape_segment(k));
                flatten_into(v, path, out);
                path.pop();
            }
        }
        JsonValue::Number(n) => {
            out.insert(path.join("."), ConfigValue::Number(n.as_f64().unwrap_or(0.0)));
        }
        JsonValue::String(s) => {
            out.insert(path.join("."), ConfigValue::String(s.clone()));
        }
        JsonValue::Bool(b) => {
            out.insert(path.join("."), ConfigValue::Bool(*b));
        }
        JsonValue::Array(_) | JsonValue::Null => {}
    }
}

/// Diffs `previous` against `current` and returns `changed(path, value, old)`
/// entries: present-in-both-but-different, added, and removed (value `None`).
pub fn diff(
    previous: &ConfigurationRecord,
    current: &ConfigurationRecord,
) -> Vec<(String, Option<ConfigValue>, Option<ConfigValue>)> {
    let mut changes = Vec::new();
    for (path, value) in current {
        match previous.get(path) {
            Some(old) if old == value => {}
            Some(old) => changes.push((path.clone(), Some(value.clone()), Some(old.clone()))),
            None => changes.push((path.clone(), Some(value.clone()), None)),
        }
    }
    for (path, old) in previous {
        if !current.contains_key(path) {
            changes.push((path.clone(), None, Some(old.clone())));
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_rule_handles_dots_and_backslashes() {
        assert_eq!(escape_segment("a.b"), "a\\.b");
        assert_eq!(escape_segment("a\\b"), "a\\\\b");
    }

    #[test]
    fn flatten_produces_dotted_paths() {
        let json = serde_json::json!({ "a": { "b": 1, "c": "x" }, "d": true });
        let flat = flatten_json(&json);
        assert_eq!(flat.get("a.b"), Some(&ConfigValue::Number(1.0)));
        assert_eq!(flat.get("a.c"), Some(&ConfigValue::String("x".into())));
        assert_eq!(flat.get("d"), Some(&ConfigValue::Bool(true)));
    }

    #[test]
    fn flatten_escapes_keys_containing_dots() {
        let json = serde_json::json!({ "a.b": 1 });
        let flat = flatten_json(&json);
        assert_eq!(flat.get("a\\.b"), Some(&ConfigValue::Number(1.0)));
    }

    #[test]
    fn diff_reports_added_changed_and_removed() {
        let mut previous = ConfigurationRecord::new();
        previous.insert("a".into(), ConfigValue::Number(1.0));
        previous.insert("b".into(), ConfigValue::Number(2.0));

        let mut current = ConfigurationRecord::new();
        current.insert("a".into(), ConfigValue::Number(1.0));
        current.insert("c".into(), ConfigValue::Number(3.0));

        let changes = diff(&previous, &current);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|(p, v, _)| p == "c" && v.is_some()));
        assert!(changes.iter().any(|(p, v, _)| p == "b" && v.is_none()));
    }

    #[test]
    fn is_behind_treats_null_as_zero() {
        let client = ChangeTimes::default();
        let server = ChangeTimes {
            command_file_ctime: Some(5),
            config_file_ctime: None,
        };
        assert!(client.is_behind(&server));
        assert!(!server.is_behind(&client));
    }
}
