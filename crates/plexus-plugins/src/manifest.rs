//! `<plugins_dir>/<plugin>/plugin.json` discovery and validation.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::record::{Capability, PluginRecord};

pub const MANIFEST_FILE: &str = "plugin.json";
pub const PORT_PLACEHOLDER: &str = "${PORT}";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    #[serde(default)]
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub standalone: bool,
}

fn default_transport() -> String {
    "http".to_string()
}

impl PluginManifest {
    /// All problems with this manifest; empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name is empty".to_string());
        } else if !valid_name(&self.name) {
            problems.push(format!(
                "name {:?} may only contain letters, digits, '-' and '_'",
                self.name
            ));
        }
        if self.transport != "http" {
            problems.push(format!("unsupported transport {:?}", self.transport));
        }
        if self.command.trim().is_empty() {
            problems.push("command is empty".to_string());
        }
        if !self.args.iter().any(|a| a.contains(PORT_PLACEHOLDER)) {
            problems.push(format!("args never mention {PORT_PLACEHOLDER}"));
        }
        if self.capabilities.is_empty() {
            problems.push("no capabilities declared".to_string());
        }
        for cap in &self.capabilities {
            if let Err(e) = cap.parse::<Capability>() {
                problems.push(e);
            }
        }
        problems
    }

    fn into_record(self, install_dir: PathBuf) -> PluginRecord {
        let capabilities = self
            .capabilities
            .iter()
            .filter_map(|c| c.parse().ok())
            .collect();
        PluginRecord {
            display_name: self.display_name,
            description: self.description,
            version: self.version,
            transport: self.transport,
            env: self.env,
            install_dir,
            standalone: self.standalone,
            ..PluginRecord::new(self.name, self.command, self.args, capabilities)
        }
    }
}

fn valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Parse and validate one manifest file. Failures produce an error-state
/// record keyed by the directory name.
pub fn load_manifest(path: &Path) -> PluginRecord {
    let install_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let dir_name = install_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => return PluginRecord::invalid(dir_name, install_dir, format!("unreadable manifest: {e}")),
    };
    let manifest: PluginManifest = match serde_json::from_str(&raw) {
        Ok(m) => m,
        Err(e) => return PluginRecord::invalid(dir_name, install_dir, format!("invalid manifest JSON: {e}")),
    };

    let problems = manifest.problems();
    if problems.is_empty() {
        manifest.into_record(install_dir)
    } else {
        let name = if valid_name(&manifest.name) && !manifest.name.is_empty() {
            manifest.name
        } else {
            dir_name
        };
        PluginRecord::invalid(name, install_dir, problems.join("; "))
    }
}

/// Scan `dir` for plugin manifests. Every manifest found yields exactly one
/// roster entry, valid or not.
pub fn discover(dir: &Path) -> Vec<PluginRecord> {
    let pattern = format!(
        "{}/*/{MANIFEST_FILE}",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let mut paths: Vec<PathBuf> = match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "bad plugin directory pattern");
            return Vec::new();
        }
    };
    paths.sort();

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let mut record = load_manifest(&path);
        if !seen.insert(record.name.clone()) {
            let original = record.name.clone();
            let mut n = 2;
            while seen.contains(&format!("{original}#{n}")) {
                n += 1;
            }
            let key = format!("{original}#{n}");
            seen.insert(key.clone());
            record = PluginRecord::invalid(
                key,
                record.install_dir,
                format!("duplicate plugin name {original:?}"),
            );
        }
        if let Some(err) = &record.manifest_error {
            warn!(plugin = %record.name, error = %err, "invalid plugin manifest");
        }
        records.push(record);
    }
    info!(dir = %dir.display(), count = records.len(), "plugins discovered");
    records
}
