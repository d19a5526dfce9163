//! Configuration loading shared by the collector and agent launchers.
//!
//! A typed config is produced in three steps: parse the YAML file (falling
//! back to built-in defaults when absent), deep-merge it over the defaults,
//! then apply `PREFIX_SECTION_KEY=value` environment overrides with type
//! coercion (bool, integer, float, string). Configuration is read once at
//! startup; there is no live reload.

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

/// Environment prefix used by both binaries.
pub const ENV_PREFIX: &str = "HONEYGRID";

/// Loads the YAML tree for a service: file over `defaults`, environment on
/// top, then typed deserialization.
pub fn load<T>(path: Option<&Path>, defaults: Value) -> Result<T>
where
    T: DeserializeOwned,
{
    let mut value = match path {
        Some(path) if path.exists() => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config file {}", path.display()))?;
            let file: Value = serde_yaml::from_str(&raw)
                .with_context(|| format!("parse config file {}", path.display()))?;
            debug!(path = %path.display(), "loaded configuration file");
            merge(defaults, file)
        }
        Some(path) => {
            warn!(path = %path.display(), "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };
    apply_env_overrides_from(&mut value, ENV_PREFIX, std::env::vars());
    serde_yaml::from_value(value).context("deserialize configuration")
}

/// Deep merge: mappings merge key-wise, anything else is replaced by the
/// override.
pub fn merge(base: Value, over: Value) -> Value {
    match (base, over) {
        (Value::Mapping(mut base), Value::Mapping(over)) => {
            for (key, value) in over {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, over) => over,
    }
}

/// Applies overrides from an explicit variable iterator (the public entry
/// point feeds `std::env::vars`; tests inject their own).
pub fn apply_env_overrides_from<I>(value: &mut Value, prefix: &str, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let prefix = format!("{prefix}_");
    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(&prefix) else {
            continue;
        };
        let segments: Vec<String> = rest.split('_').map(|s| s.to_lowercase()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            continue;
        }
        apply_override(value, &segments, coerce(&raw));
        debug!(var = %key, "applied environment override");
    }
}

/// Walks the tree along `segments`, preferring the longest key already
/// present at each level so multi-word keys like `rate_limit_seconds`
/// resolve correctly; unknown paths fall back to one level per segment.
fn apply_override(value: &mut Value, segments: &[String], new: Value) {
    if !matches!(value, Value::Mapping(_)) {
        *value = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = value else {
        unreachable!()
    };

    // Longest joined prefix that names an existing key at this level.
    for take in (1..=segments.len()).rev() {
        let joined = segments[..take].join("_");
        let key = Value::String(joined, None);
        if let Some(existing) = map.get_mut(&key) {
            if take == segments.len() {
                *existing = new;
            } else {
                apply_override(existing, &segments[take..], new);
            }
            return;
        }
    }

    // Nothing matches: create nested mappings, one segment per level.
    let key = Value::String(segments[0].clone(), None);
    if segments.len() == 1 {
        map.insert(key, new);
    } else {
        let mut child = Value::Mapping(Mapping::new());
        apply_override(&mut child, &segments[1..], new);
        map.insert(key, child);
    }
}

/// Coerces a raw environment string into the closest YAML scalar.
pub fn coerce(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true, None);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false, None);
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into(), None);
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        return Value::Number(float.into(), None);
    }
    Value::String(raw.to_string(), None)
}
