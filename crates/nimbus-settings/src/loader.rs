//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`NimbusSettings::default()`]
//! 2. If `~/.nimbus/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `NIMBUS_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::NimbusSettings;

/// Resolve the Nimbus home directory (`~/.nimbus`).
pub fn nimbus_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".nimbus")
}

/// Resolve the path to the settings file (`~/.nimbus/settings.json`).
pub fn settings_path() -> PathBuf {
    nimbus_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<NimbusSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<NimbusSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the settings file, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<NimbusSettings> {
    let defaults = serde_json::to_value(NimbusSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut NimbusSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup (the process environment in production).
///
/// Invalid values are logged and ignored.
pub fn apply_overrides<F>(settings: &mut NimbusSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let ranged = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    };

    if let Some(v) = string("NIMBUS_BASE_URL") {
        settings.api.base_url = v;
    }
    if let Some(v) = string("NIMBUS_ACCESS_TOKEN") {
        settings.api.access_token = Some(v);
    }
    if let Some(v) = string("NIMBUS_REFRESH_TOKEN") {
        settings.api.refresh_token = Some(v);
    }
    if let Some(v) = ranged("NIMBUS_CONNECT_TIMEOUT_MS", 1_000, 600_000) {
        settings.api.connect_timeout_ms = v;
    }
    if let Some(v) = ranged("NIMBUS_CANCEL_COOLDOWN_MS", 0, 60_000) {
        settings.stream.cancel_cooldown_ms = v;
    }
    if let Some(val) = lookup("NIMBUS_RECOVERY_ENABLED") {
        match parse_bool(&val) {
            Some(v) => settings.recovery.enabled = v,
            None => {
                tracing::warn!(key = "NIMBUS_RECOVERY_ENABLED", value = %val, "invalid boolean env var, ignoring");
            }
        }
    }
    if let Some(v) = string("NIMBUS_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
