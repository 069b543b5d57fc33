//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ConnectivitySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `TWINBRIDGE_*` environment variable overrides
//! 4. Run [`ConnectivitySettings::validate`]

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ConnectivitySettings;

/// Default settings file (`~/.twinbridge/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".twinbridge").join("settings.json")
}

pub fn load_settings() -> Result<ConnectivitySettings> {
    load_settings_from_path(&settings_path())
}

/// Missing file means defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ConnectivitySettings> {
    let defaults = serde_json::to_value(ConnectivitySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ConnectivitySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive merge: objects merge per key, everything else is replaced,
/// nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut ConnectivitySettings) {
    if let Some(v) = read_env_u64("TWINBRIDGE_CLIENT_RESTARTS", 0, 1_000) {
        settings.supervisor.client_actor_restarts_before_escalation = v as u32;
    }
    if let Some(v) = read_env_u64("TWINBRIDGE_WORKER_RETRIES", 0, 1_000) {
        settings.supervisor.worker_retries_until_escalate = v as i64;
    }
    if let Some(v) = read_env_u64("TWINBRIDGE_ASK_TIMEOUT_MS", 10, 600_000) {
        settings.supervisor.ask_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("TWINBRIDGE_CLOSE_TIMEOUT_MS", 10, 600_000) {
        settings.supervisor.close_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("TWINBRIDGE_HEALTH_INTERVAL_MS", 10, 3_600_000) {
        settings.health.interval_ms = v;
    }
    if let Some(v) = read_env_u64("TWINBRIDGE_HEALTH_TIMEOUT_MS", 10, 3_600_000) {
        settings.health.timeout_ms = v;
    }
    if let Some(v) = read_env_string("TWINBRIDGE_NODE") {
        settings.cluster.local_node = v;
    }
    if let Some(v) = read_env_list("TWINBRIDGE_NODES") {
        settings.cluster.nodes = v;
    }
    if let Some(v) = read_env_list("TWINBRIDGE_BLOCKED_HOSTNAMES") {
        settings.hosts.blocked_hostnames = v;
    }
    if let Some(v) = read_env_list("TWINBRIDGE_ALLOWED_HOSTNAMES") {
        settings.hosts.allowed_hostnames = v;
    }
    if let Some(v) = read_env_string("TWINBRIDGE_DB") {
        settings.store.database_path = v;
    }
    if let Some(v) = read_env_string("TWINBRIDGE_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = read_env_bool("TWINBRIDGE_JSON_LOGS") {
        settings.telemetry.json_logs = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Comma-separated list, blanks dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_list(name: &str) -> Option<Vec<String>> {
    read_env_string(name).map(|v| parse_list(&v))
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
