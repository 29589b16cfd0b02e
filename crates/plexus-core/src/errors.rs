use std::time::Duration;

/// Failure taxonomy for JSON-RPC calls to a plugin endpoint.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("{method} returned HTTP {status}: {body}")]
    Http {
        method: String,
        status: u16,
        body: String,
    },

    #[error("{method} failed with JSON-RPC error {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The plugin ran the tool and flagged the result as an error.
    #[error("tool {tool} reported an error: {}", content_text(.content))]
    ToolExecution {
        tool: String,
        content: serde_json::Value,
    },

    #[error("network error calling {method}: {message}")]
    Network { method: String, message: String },

    #[error("malformed response to {method}: {message}")]
    Malformed { method: String, message: String },
}

impl TransportError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Http { .. } => "http",
            Self::Rpc { .. } => "rpc",
            Self::ToolExecution { .. } => "tool_execution",
            Self::Network { .. } => "network",
            Self::Malformed { .. } => "malformed",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Flatten a tool result `content` array into readable text.
pub fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::Array(blocks) => {
            let parts: Vec<String> = blocks
                .iter()
                .map(|b| match b.get("text").and_then(|t| t.as_str()) {
                    Some(text) => text.to_string(),
                    None => b.to_string(),
                })
                .collect();
            parts.join("\n")
        }
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
