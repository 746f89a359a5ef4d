//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{veritas_home, VeritasSettings};

/// Resolve the path to the settings file (`~/.veritas/settings.json`).
pub fn settings_path() -> PathBuf {
    veritas_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<VeritasSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a malformed one, or one that leaves a
/// setting unusable, is an error.
pub fn load_settings_from_path(path: &Path) -> Result<VeritasSettings> {
    let mut settings = load_file_layers(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn load_file_layers(path: &Path) -> Result<VeritasSettings> {
    let parse_err = |source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let defaults = serde_json::to_value(VeritasSettings::default()).map_err(parse_err)?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(parse_err)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    serde_json::from_value(merged).map_err(parse_err)
}

/// Reject values that deserialize but cannot work at runtime.
pub fn validate(settings: &VeritasSettings) -> Result<()> {
    if !is_http_url(&settings.backend.base_url) {
        return Err(SettingsError::invalid(
            "backend.baseUrl",
            format!("{:?} is not an http(s) URL", settings.backend.base_url),
        ));
    }
    if settings.backend.connect_timeout_secs == 0 {
        return Err(SettingsError::invalid("backend.connectTimeoutSecs", "must be at least 1"));
    }
    if settings.backend.idle_timeout_secs == 0 {
        return Err(SettingsError::invalid("backend.idleTimeoutSecs", "must be at least 1"));
    }
    if settings.research.idle_timeout_secs == 0 {
        return Err(SettingsError::invalid("research.idleTimeoutSecs", "must be at least 1"));
    }
    if !is_http_url(&settings.research.llm_base_url) {
        return Err(SettingsError::invalid(
            "research.llmBaseUrl",
            format!("{:?} is not an http(s) URL", settings.research.llm_base_url),
        ));
    }
    if settings.storage.db_path.as_os_str().is_empty() {
        return Err(SettingsError::invalid("storage.dbPath", "must not be empty"));
    }
    if settings.storage.db_path.is_dir() {
        return Err(SettingsError::invalid(
            "storage.dbPath",
            format!("{} is a directory", settings.storage.db_path.display()),
        ));
    }
    if settings.projection.title_max_chars == 0 {
        return Err(SettingsError::invalid("projection.titleMaxChars", "must be at least 1"));
    }
    Ok(())
}

fn is_http_url(url: &str) -> bool {
    ["http://", "https://"]
        .iter()
        .any(|scheme| url.strip_prefix(scheme).is_some_and(|rest| !rest.is_empty()))
}

/// Recursive deep merge of two JSON values.
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

/// Apply `VERITAS_*` environment overrides. Invalid values are logged and
/// ignored.
pub fn apply_env_overrides(settings: &mut VeritasSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

fn apply_overrides_from(settings: &mut VeritasSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("VERITAS_BACKEND_URL") {
        if is_http_url(&v) {
            settings.backend.base_url = v.trim_end_matches('/').to_string();
        } else {
            tracing::warn!(key = "VERITAS_BACKEND_URL", value = %v, "not an http(s) URL, ignoring");
        }
    }
    if let Some(v) = read("VERITAS_IDLE_TIMEOUT_SECS") {
        match parse_u64_range(&v, 1, 86_400) {
            Some(n) => settings.backend.idle_timeout_secs = n,
            None => tracing::warn!(key = "VERITAS_IDLE_TIMEOUT_SECS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("VERITAS_DB_PATH") {
        settings.storage.db_path = PathBuf::from(v);
    }
    if let Some(v) = read("VERITAS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("VERITAS_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => tracing::warn!(key = "VERITAS_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
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

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
