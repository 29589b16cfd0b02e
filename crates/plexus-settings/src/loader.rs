//! Settings loading: compiled defaults, then `~/.plexus/settings.json`
//! deep-merged on top, then `PLEXUS_*` environment overrides.
//!
//! Merge rules: objects merge per key, arrays and scalars are replaced,
//! nulls in the file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{plexus_home, PlexusSettings};

/// `~/.plexus/settings.json`.
pub fn settings_path() -> PathBuf {
    plexus_home().join("settings.json")
}

pub fn load_settings() -> Result<PlexusSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from a specific file. A missing file yields defaults; invalid JSON or
/// a failed validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<PlexusSettings> {
    let defaults = serde_json::to_value(PlexusSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: PlexusSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

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

/// Apply `PLEXUS_*` overrides. Values that fail to parse or fall outside
/// their range are ignored with a warning.
pub fn apply_env_overrides(settings: &mut PlexusSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub fn apply_overrides_from<F>(settings: &mut PlexusSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("PLEXUS_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("PLEXUS_PORT", 1, 65535) {
        settings.server.port = v;
    }

    if let Some(v) = env.string("PLEXUS_PLUGINS_DIR") {
        settings.plugins.dir = v;
    }
    if let Some(v) = env.u16("PLEXUS_PORT_RANGE_START", 1024, 65535) {
        settings.plugins.port_range_start = v;
    }
    if let Some(v) = env.u16("PLEXUS_PORT_RANGE_END", 1024, 65535) {
        settings.plugins.port_range_end = v;
    }
    if let Some(v) = env.u64("PLEXUS_SETTLE_MS", 0, 60_000) {
        settings.plugins.settle_ms = v;
    }
    if let Some(v) = env.u64("PLEXUS_MAX_SPAWN_ATTEMPTS", 1, 100) {
        settings.plugins.max_spawn_attempts = v as u32;
    }
    if let Some(v) = env.u64("PLEXUS_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
        settings.plugins.handshake_timeout_ms = v;
    }
    if let Some(v) = env.u64("PLEXUS_CALL_TOOL_TIMEOUT_MS", 100, 3_600_000) {
        settings.plugins.call_tool_timeout_ms = v;
    }
    if let Some(v) = env.string("PLEXUS_LEDGER_DIR") {
        settings.plugins.ledger_dir = v;
    }

    if let Some(v) = env.string("PLEXUS_RUNTIME_BINARY") {
        settings.runtime.binary = v;
    }
    if let Some(v) = env.string("PLEXUS_MODEL") {
        settings.runtime.model = Some(v);
    }
    if let Some(v) = env.string("PLEXUS_DATA_DIR") {
        settings.storage.data_dir = v;
    }

    if let Some(v) = env.string("PLEXUS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("PLEXUS_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = env.bool("PLEXUS_LOG_TO_SQLITE") {
        settings.logging.log_to_sqlite = v;
    }
}

// ── Pure parsers ─────────────────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> PlexusSettings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut settings = PlexusSettings::default();
        apply_overrides_from(&mut settings, |name| map.get(name).cloned());
        settings
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"plugins": {"settleMs": 500, "dir": "plugins"}});
        let source = serde_json::json!({"plugins": {"settleMs": 250}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["plugins"]["settleMs"], 250);
        assert_eq!(merged["plugins"]["dir"], "plugins");
    }

    #[test]
    fn merge_skips_null_and_replaces_arrays() {
        let target = serde_json::json!({"a": 1, "args": ["x", "y"]});
        let source = serde_json::json!({"a": null, "args": ["z"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["args"], serde_json::json!(["z"]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.plugins.port_range_start, 50_000);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9000}, "runtime": {"extraArgs": ["--verbose"]}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.runtime.extra_args, vec!["--verbose"]);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn inverted_range_in_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"plugins": {"portRangeStart": 60000, "portRangeEnd": 59000}}"#,
        )
        .unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let s = overrides(&[
            ("PLEXUS_PORT", "8123"),
            ("PLEXUS_PORT_RANGE_START", "40000"),
            ("PLEXUS_LOG_JSON", "yes"),
            ("PLEXUS_MODEL", "sonnet"),
        ]);
        assert_eq!(s.server.port, 8123);
        assert_eq!(s.plugins.port_range_start, 40_000);
        assert!(s.logging.json);
        assert_eq!(s.runtime.model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn invalid_env_values_ignored() {
        let s = overrides(&[
            ("PLEXUS_PORT", "0"),
            ("PLEXUS_SETTLE_MS", "soon"),
            ("PLEXUS_LOG_TO_SQLITE", "maybe"),
            ("PLEXUS_HOST", ""),
        ]);
        assert_eq!(s, PlexusSettings::default());
    }

    #[test]
    fn parsers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range("500", 0, 1000), Some(500));
        assert_eq!(parse_u64_range("-1", 0, 1000), None);
    }
}
