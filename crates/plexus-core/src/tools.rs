use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;

/// One entry of a plugin's tool catalog, as returned by `tools/list`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

/// A tool server the agent runtime may connect to for one turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl ToolServerConfig {
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "http".into(),
            url: url.into(),
        }
    }
}

/// Render configs in the `{"mcpServers": {name: {type, url}}}` layout agent
/// CLIs accept.
pub fn mcp_servers_document(servers: &[ToolServerConfig]) -> serde_json::Value {
    let map: BTreeMap<&str, &ToolServerConfig> =
        servers.iter().map(|s| (s.name.as_str(), s)).collect();
    serde_json::json!({ "mcpServers": map })
}

/// Long-running job operations a "worker" plugin exposes.
#[async_trait]
pub trait WorkerDispatch: Send + Sync {
    fn plugin(&self) -> &str;
    async fn dispatch(&self, job: serde_json::Value) -> Result<serde_json::Value, TransportError>;
    async fn list(&self) -> Result<serde_json::Value, TransportError>;
    async fn status(&self, job_id: &str) -> Result<serde_json::Value, TransportError>;
    async fn result(&self, job_id: &str) -> Result<serde_json::Value, TransportError>;
    async fn cancel(&self, job_id: &str) -> Result<serde_json::Value, TransportError>;
    async fn delete(&self, job_id: &str) -> Result<serde_json::Value, TransportError>;
}
