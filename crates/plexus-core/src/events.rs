use serde::{Deserialize, Serialize};

use crate::ids::{QueryId, SessionId};
use crate::tools::ToolDefinition;

/// Uniform events emitted while a query runs, published on the session's
/// channel. Every query ends with exactly one `Done`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueryEvent {
    #[serde(rename = "processing_started")]
    ProcessingStarted {
        session_id: SessionId,
        query_id: QueryId,
        resumed: bool,
    },

    #[serde(rename = "text_delta")]
    TextDelta { session_id: SessionId, delta: String },

    #[serde(rename = "tool_started")]
    ToolStarted {
        session_id: SessionId,
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_summary")]
    ToolSummary {
        session_id: SessionId,
        summary: String,
        tool_use_ids: Vec<String>,
    },

    #[serde(rename = "status_changed")]
    StatusChanged { session_id: SessionId, status: String },

    #[serde(rename = "error")]
    Error { session_id: SessionId, message: String },

    #[serde(rename = "done")]
    Done { session_id: SessionId },
}

impl QueryEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::ProcessingStarted { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ToolStarted { session_id, .. }
            | Self::ToolSummary { session_id, .. }
            | Self::StatusChanged { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::Done { session_id } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ProcessingStarted { .. } => "processing_started",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolSummary { .. } => "tool_summary",
            Self::StatusChanged { .. } => "status_changed",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Plugin lifecycle notifications from the lifecycle manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PluginEvent {
    #[serde(rename = "plugin_started")]
    Started {
        plugin: String,
        port: u16,
        pid: Option<u32>,
        reconnected: bool,
    },

    #[serde(rename = "plugin_stopped")]
    Stopped { plugin: String },

    #[serde(rename = "plugin_error")]
    Error { plugin: String, message: String },

    #[serde(rename = "plugin_tools_updated")]
    ToolsUpdated {
        plugin: String,
        tools: Vec<ToolDefinition>,
    },
}

impl PluginEvent {
    pub fn plugin(&self) -> &str {
        match self {
            Self::Started { plugin, .. }
            | Self::Stopped { plugin }
            | Self::Error { plugin, .. }
            | Self::ToolsUpdated { plugin, .. } => plugin,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "plugin_started",
            Self::Stopped { .. } => "plugin_stopped",
            Self::Error { .. } => "plugin_error",
            Self::ToolsUpdated { .. } => "plugin_tools_updated",
        }
    }
}
