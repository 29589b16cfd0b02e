//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a partial
//! settings file only needs the keys it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 7420 },
///   "plugins": { "dir": "/opt/plexus/plugins", "portRangeStart": 52000 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexusSettings {
    pub server: ServerSettings,
    pub plugins: PluginSettings,
    pub runtime: RuntimeSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl PlexusSettings {
    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        let p = &self.plugins;
        if p.port_range_start > p.port_range_end {
            return Err(SettingsError::InvalidValue(format!(
                "plugin port range {}..{} is inverted",
                p.port_range_start, p.port_range_end
            )));
        }
        if p.max_spawn_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "plugins.maxSpawnAttempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
        }
    }
}

/// Plugin discovery and process supervision settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginSettings {
    /// Directory scanned for `<plugin>/plugin.json` (relative to `~/.plexus`).
    pub dir: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// How long a fresh process gets to exit with the collision code.
    pub settle_ms: u64,
    pub max_spawn_attempts: u32,
    pub handshake_timeout_ms: u64,
    pub list_tools_timeout_ms: u64,
    pub call_tool_timeout_ms: u64,
    pub stop_grace_ms: u64,
    /// Tail of stderr kept per process for diagnostics.
    pub stderr_limit_bytes: usize,
    /// Liveness poll interval for processes adopted from the pid ledger.
    pub liveness_poll_ms: u64,
    /// Directory holding one pid file per plugin (relative to `~/.plexus`).
    pub ledger_dir: String,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            dir: "plugins".to_string(),
            port_range_start: 50_000,
            port_range_end: 51_000,
            settle_ms: 500,
            max_spawn_attempts: 10,
            handshake_timeout_ms: 10_000,
            list_tools_timeout_ms: 30_000,
            call_tool_timeout_ms: 120_000,
            stop_grace_ms: 5_000,
            stderr_limit_bytes: 8 * 1024,
            liveness_poll_ms: 2_000,
            ledger_dir: "run".to_string(),
        }
    }
}

impl PluginSettings {
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn list_tools_timeout(&self) -> Duration {
        Duration::from_millis(self.list_tools_timeout_ms)
    }

    pub fn call_tool_timeout(&self) -> Duration {
        Duration::from_millis(self.call_tool_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}

/// External agent CLI settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    /// Executable launched in print mode for each turn.
    pub binary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    /// Working directory for the agent process; defaults to the server's cwd.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: None,
            extra_args: Vec::new(),
            working_directory: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Directory holding `plexus.db` (relative to `~/.plexus`).
    pub data_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub log_to_sqlite: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_to_sqlite: true,
        }
    }
}

/// `~/.plexus`, falling back to `/tmp/.plexus` without `HOME`.
pub fn plexus_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".plexus")
}

/// Resolve a configured path: absolute paths pass through, `~/` expands to
/// `HOME`, anything else is taken relative to `base`.
pub fn resolve_path(base: &Path, value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        return PathBuf::from(home).join(rest);
    }
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
