//! Free-form key/value options attached to nodes, chains and handlers.
//!
//! Keys are matched case-insensitively. Values keep their JSON shape and are
//! coerced on read by the typed getters, so `"10"`, `10` and `"10s"` are all
//! accepted where a duration is expected.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Metadata {
    values: HashMap<String, Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut md = Self::new();
        for (k, v) in pairs {
            md.set(k, v);
        }
        md
    }

    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<Value>) {
        self.values
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(&key.to_ascii_lowercase())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(&key.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns `false` for absent keys and for values that do not read as true.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
            Some(Value::String(s)) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            ),
            _ => false,
        }
    }

    /// Returns 0 for absent or non-numeric values.
    pub fn get_int(&self, key: &str) -> i64 {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            Some(Value::Bool(true)) => 1,
            _ => 0,
        }
    }

    pub fn get_string(&self, key: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    /// Plain numbers are seconds; strings may use humantime units (`"500ms"`, `"1m30s"`).
    /// Returns `Duration::ZERO` for absent or unparsable values.
    pub fn get_duration(&self, key: &str) -> Duration {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_f64()
                .filter(|f| *f > 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or_default(),
            Some(Value::String(s)) => parse_duration(s).unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// Comma separated string or JSON array of strings.
    pub fn get_strings(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).ok()
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: HashMap<String, Value> = HashMap::deserialize(deserializer)?;
        Ok(Self::from_pairs(raw))
    }
}

/// Implemented by values that carry metadata (nodes, chains).
pub trait Metadatable {
    fn metadata(&self) -> &Metadata;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let md = Metadata::from_pairs([("maxFails", 3)]);
        assert!(md.contains("maxfails"));
        assert_eq!(md.get_int("MAXFAILS"), 3);
    }

    #[test]
    fn typed_getters_coerce_strings() {
        let md = Metadata::from_pairs([
            ("bind", Value::from("true")),
            ("weight", Value::from("5")),
            ("failTimeout", Value::from("1m30s")),
            ("readTimeout", Value::from(2)),
            ("ttl", Value::from("15")),
        ]);
        assert!(md.get_bool("bind"));
        assert_eq!(md.get_int("weight"), 5);
        assert_eq!(md.get_duration("failTimeout"), Duration::from_secs(90));
        assert_eq!(md.get_duration("readTimeout"), Duration::from_secs(2));
        assert_eq!(md.get_duration("ttl"), Duration::from_secs(15));
    }

    #[test]
    fn missing_values_use_zero_defaults() {
        let md = Metadata::new();
        assert!(!md.get_bool("backup"));
        assert_eq!(md.get_int("weight"), 0);
        assert_eq!(md.get_duration("x"), Duration::ZERO);
        assert!(md.get_string("x").is_empty());
    }

    #[test]
    fn deserialize_lowercases_keys() {
        let md: Metadata = serde_json::from_str(r#"{"noDelay": true, "hosts": "a,b"}"#).unwrap();
        assert!(md.get_bool("nodelay"));
        assert_eq!(md.get_strings("hosts"), vec!["a", "b"]);
    }
}
