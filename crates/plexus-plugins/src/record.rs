use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use plexus_core::ToolDefinition;

use crate::supervisor::LaunchSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Serves a tool catalog to the agent runtime.
    Tools,
    /// Accepts long-running jobs through the `jobs/*` methods.
    Worker,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tools" => Ok(Self::Tools),
            "worker" => Ok(Self::Worker),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Discovered, never started.
    Available,
    /// Stopped after having run.
    Disconnected,
    Connected,
    Error,
}

/// A discovered plugin plus its mutable runtime state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub transport: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub capabilities: Vec<Capability>,
    pub install_dir: PathBuf,
    pub standalone: bool,
    /// Set when the manifest failed validation; such plugins never launch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_error: Option<String>,

    pub status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PluginRecord {
    /// A launchable record with no runtime state yet.
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        capabilities: Vec<Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            description: None,
            version: None,
            transport: "http".to_string(),
            command: command.into(),
            args,
            env: BTreeMap::new(),
            capabilities,
            install_dir: PathBuf::from("."),
            standalone: false,
            manifest_error: None,
            status: PluginStatus::Available,
            port: None,
            pid: None,
            tools: Vec::new(),
            last_error: None,
        }
    }

    /// Roster entry for a manifest that failed validation.
    pub fn invalid(name: impl Into<String>, install_dir: PathBuf, diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        Self {
            install_dir,
            status: PluginStatus::Error,
            manifest_error: Some(diagnostic.clone()),
            last_error: Some(diagnostic),
            ..Self::new(name, "", Vec::new(), Vec::new())
        }
    }

    pub fn standalone(mut self, standalone: bool) -> Self {
        self.standalone = standalone;
        self
    }

    pub fn is_launchable(&self) -> bool {
        self.manifest_error.is_none()
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Worker-only plugins are reached through dispatch adapters, not as
    /// tool servers.
    pub fn serves_tools(&self) -> bool {
        self.has_capability(Capability::Tools)
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            work_dir: self.install_dir.clone(),
        }
    }

    pub(crate) fn mark_connected(&mut self, port: u16, pid: Option<u32>, tools: Vec<ToolDefinition>) {
        self.status = PluginStatus::Connected;
        self.port = Some(port);
        self.pid = pid;
        self.tools = tools;
        self.last_error = None;
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.status = PluginStatus::Disconnected;
        self.port = None;
        self.pid = None;
    }

    pub(crate) fn mark_failed(&mut self, diagnostic: String) {
        self.status = PluginStatus::Error;
        self.port = None;
        self.pid = None;
        self.last_error = Some(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_only_does_not_serve_tools() {
        let worker = PluginRecord::new("jobs", "node", vec![], vec![Capability::Worker]);
        assert!(!worker.serves_tools());
        assert!(worker.has_capability(Capability::Worker));

        let both = PluginRecord::new("mixed", "node", vec![], vec![Capability::Tools, Capability::Worker]);
        assert!(both.serves_tools());
    }

    #[test]
    fn invalid_record_is_error_state() {
        let rec = PluginRecord::invalid("broken", PathBuf::from("/p/broken"), "command is empty");
        assert_eq!(rec.status, PluginStatus::Error);
        assert!(!rec.is_launchable());
        assert_eq!(rec.last_error.as_deref(), Some("command is empty"));
    }

    #[test]
    fn state_transitions() {
        let mut rec = PluginRecord::new("notes", "node", vec![], vec![Capability::Tools]);
        rec.mark_connected(50_001, Some(77), vec![]);
        assert_eq!(rec.status, PluginStatus::Connected);
        rec.mark_failed("exited with code 1".into());
        assert_eq!(rec.status, PluginStatus::Error);
        assert!(rec.port.is_none());
        assert!(rec.is_launchable());
        rec.mark_connected(50_002, None, vec![]);
        assert!(rec.last_error.is_none());
        rec.mark_stopped();
        assert_eq!(rec.status, PluginStatus::Disconnected);
    }

    #[test]
    fn serializes_camel_case() {
        let rec = PluginRecord::new("notes", "node", vec!["${PORT}".into()], vec![Capability::Tools]);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["status"], "available");
        assert_eq!(json["capabilities"][0], "tools");
        assert!(json.get("installDir").is_some());
        assert!(json.get("manifestError").is_none());
    }
}
