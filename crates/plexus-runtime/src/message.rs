//! One line of the runtime's `stream-json` output.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeMessage {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: MessageBody,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Tool results come back as user turns.
    User {
        message: MessageBody,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Raw streaming event; only text deltas are consumed.
    StreamEvent {
        event: Value,
        #[serde(default)]
        session_id: Option<String>,
    },
    ToolProgress {
        tool_use_id: String,
        tool_name: String,
        #[serde(default)]
        elapsed_time_seconds: Option<f64>,
        #[serde(default)]
        session_id: Option<String>,
    },
    ToolUseSummary {
        summary: String,
        #[serde(default)]
        preceding_tool_use_ids: Vec<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        errors: Vec<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default = "MessageContent::empty")]
    pub content: MessageContent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    fn empty() -> Self {
        Self::Blocks(Vec::new())
    }

    /// The content as blocks; plain text becomes one text block.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            Self::Blocks(blocks) => blocks.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

impl RuntimeMessage {
    /// The runtime's own conversation id, if this message carries one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id, .. }
            | Self::StreamEvent { session_id, .. }
            | Self::ToolProgress { session_id, .. }
            | Self::ToolUseSummary { session_id, .. }
            | Self::Result { session_id, .. } => session_id.as_deref().filter(|s| !s.is_empty()),
            Self::Unknown => None,
        }
    }

    /// Text of a `content_block_delta` / `text_delta` stream event.
    pub fn text_delta(&self) -> Option<&str> {
        let Self::StreamEvent { event, .. } = self else {
            return None;
        };
        if event.get("type")?.as_str()? != "content_block_delta" {
            return None;
        }
        let delta = event.get("delta")?;
        if delta.get("type")?.as_str()? != "text_delta" {
            return None;
        }
        delta.get("text")?.as_str()
    }

    pub fn init(session_id: &str) -> Self {
        Self::System {
            subtype: Some("init".into()),
            session_id: Some(session_id.into()),
            model: None,
        }
    }

    pub fn assistant_text(text: &str) -> Self {
        Self::Assistant {
            message: MessageBody {
                content: MessageContent::Blocks(vec![ContentBlock::Text { text: text.into() }]),
            },
            session_id: None,
        }
    }

    pub fn tool_use(id: &str, name: &str, input: Value) -> Self {
        Self::Assistant {
            message: MessageBody {
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: id.into(),
                    name: name.into(),
                    input,
                }]),
            },
            session_id: None,
        }
    }

    pub fn tool_result(tool_use_id: &str, content: Value) -> Self {
        Self::User {
            message: MessageBody {
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.into(),
                    content,
                    is_error: false,
                }]),
            },
            session_id: None,
        }
    }

    pub fn delta(text: &str) -> Self {
        Self::StreamEvent {
            event: json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": text }
            }),
            session_id: None,
        }
    }

    pub fn success(session_id: &str, result: &str) -> Self {
        Self::Result {
            subtype: Some("success".into()),
            is_error: false,
            result: Some(result.into()),
            errors: Vec::new(),
            session_id: Some(session_id.into()),
        }
    }

    pub fn failure(session_id: Option<&str>, error: &str) -> Self {
        Self::Result {
            subtype: Some("error_during_execution".into()),
            is_error: true,
            result: None,
            errors: vec![error.into()],
            session_id: session_id.map(str::to_string),
        }
    }
}
