//! Runtime messages in, uniform [`QueryEvent`]s out, plus the accumulated
//! turn content that gets persisted when the query ends.

use serde_json::Value;

use plexus_core::{QueryEvent, SessionId};
use plexus_runtime::{ContentBlock, RuntimeMessage};

/// One tool call seen during the turn.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub result: Option<Value>,
}

pub struct Translator {
    session_id: SessionId,
    text: String,
    /// Deltas already carried this message's text to subscribers.
    streamed: bool,
    tools: Vec<ToolInvocation>,
    errors: Vec<String>,
    remote_session_id: Option<String>,
    final_result: Option<String>,
}

impl Translator {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            text: String::new(),
            streamed: false,
            tools: Vec::new(),
            errors: Vec::new(),
            remote_session_id: None,
            final_result: None,
        }
    }

    pub fn translate(&mut self, message: &RuntimeMessage) -> Vec<QueryEvent> {
        if self.remote_session_id.is_none() {
            self.remote_session_id = message.session_id().map(str::to_string);
        }
        let session_id = self.session_id.clone();

        match message {
            RuntimeMessage::StreamEvent { .. } => match message.text_delta() {
                Some(delta) if !delta.is_empty() => {
                    self.streamed = true;
                    vec![QueryEvent::TextDelta {
                        session_id,
                        delta: delta.to_string(),
                    }]
                }
                _ => Vec::new(),
            },
            RuntimeMessage::Assistant { message, .. } => {
                let mut events = Vec::new();
                for block in message.content.blocks() {
                    match block {
                        ContentBlock::Text { text } if !text.is_empty() => {
                            if !self.text.is_empty() {
                                self.text.push_str("\n\n");
                            }
                            self.text.push_str(&text);
                            if !self.streamed {
                                events.push(QueryEvent::TextDelta {
                                    session_id: session_id.clone(),
                                    delta: text,
                                });
                            }
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            events.push(QueryEvent::ToolStarted {
                                session_id: session_id.clone(),
                                tool_use_id: id.clone(),
                                tool_name: name.clone(),
                                input: input.clone(),
                            });
                            self.tools.push(ToolInvocation {
                                id,
                                name,
                                input,
                                result: None,
                            });
                        }
                        _ => {}
                    }
                }
                self.streamed = false;
                events
            }
            RuntimeMessage::User { message, .. } => {
                for block in message.content.blocks() {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    {
                        if let Some(tool) = self.tools.iter_mut().find(|t| t.id == tool_use_id) {
                            tool.result = Some(content);
                        }
                    }
                }
                Vec::new()
            }
            RuntimeMessage::ToolProgress { tool_name, .. } => vec![QueryEvent::StatusChanged {
                session_id,
                status: format!("running {tool_name}"),
            }],
            RuntimeMessage::ToolUseSummary {
                summary,
                preceding_tool_use_ids,
                ..
            } => vec![QueryEvent::ToolSummary {
                session_id,
                summary: summary.clone(),
                tool_use_ids: preceding_tool_use_ids.clone(),
            }],
            RuntimeMessage::Result {
                is_error,
                errors,
                result,
                subtype,
                ..
            } => {
                if !*is_error {
                    self.final_result = result.clone();
                    return Vec::new();
                }
                let message = if !errors.is_empty() {
                    errors.join("; ")
                } else {
                    result
                        .clone()
                        .or_else(|| subtype.clone())
                        .unwrap_or_else(|| "agent runtime reported an error".to_string())
                };
                vec![self.fail(message)]
            }
            RuntimeMessage::System { .. } | RuntimeMessage::Unknown => Vec::new(),
        }
    }

    /// Record a failure from outside the message stream.
    pub fn fail(&mut self, message: impl Into<String>) -> QueryEvent {
        let message = message.into();
        self.errors.push(message.clone());
        QueryEvent::Error {
            session_id: self.session_id.clone(),
            message,
        }
    }

    /// Assistant text for the transcript; the final result stands in when
    /// no assistant message carried text.
    pub fn text(&self) -> &str {
        if self.text.is_empty() {
            self.final_result.as_deref().unwrap_or("")
        } else {
            &self.text
        }
    }

    pub fn tools(&self) -> &[ToolInvocation] {
        &self.tools
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn remote_session_id(&self) -> Option<&str> {
        self.remote_session_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn translator() -> Translator {
        Translator::new(SessionId::from_raw("2026-10-16-notes"))
    }

    #[test]
    fn captures_first_remote_id_only() {
        let mut t = translator();
        t.translate(&RuntimeMessage::init("r-1"));
        t.translate(&RuntimeMessage::success("r-2", "ok"));
        assert_eq!(t.remote_session_id(), Some("r-1"));
    }

    #[test]
    fn deltas_suppress_duplicate_text() {
        let mut t = translator();
        let first = t.translate(&RuntimeMessage::delta("Hel"));
        let second = t.translate(&RuntimeMessage::delta("lo"));
        let full = t.translate(&RuntimeMessage::assistant_text("Hello"));
        assert_eq!(first.len() + second.len(), 2);
        assert!(full.is_empty());
        assert_eq!(t.text(), "Hello");

        let unstreamed = t.translate(&RuntimeMessage::assistant_text("Again"));
        assert!(matches!(&unstreamed[0], QueryEvent::TextDelta { delta, .. } if delta == "Again"));
        assert_eq!(t.text(), "Hello\n\nAgain");
    }

    #[test]
    fn tool_use_and_result_pair_up() {
        let mut t = translator();
        let events = t.translate(&RuntimeMessage::tool_use("toolu_1", "search", json!({"q": "rust"})));
        assert_eq!(events[0].event_type(), "tool_started");
        t.translate(&RuntimeMessage::tool_result("toolu_1", json!("3 hits")));
        t.translate(&RuntimeMessage::tool_result("toolu_unknown", json!("ignored")));

        assert_eq!(
            t.tools(),
            &[ToolInvocation {
                id: "toolu_1".into(),
                name: "search".into(),
                input: json!({"q": "rust"}),
                result: Some(json!("3 hits")),
            }]
        );
    }

    #[test]
    fn summaries_and_progress() {
        let mut t = translator();
        let summary = t.translate(&RuntimeMessage::ToolUseSummary {
            summary: "Read 2 files".into(),
            preceding_tool_use_ids: vec!["toolu_1".into()],
            session_id: None,
        });
        assert_eq!(summary[0].event_type(), "tool_summary");
        let progress = t.translate(&RuntimeMessage::ToolProgress {
            tool_use_id: "toolu_1".into(),
            tool_name: "search".into(),
            elapsed_time_seconds: Some(1.5),
            session_id: None,
        });
        assert!(matches!(&progress[0], QueryEvent::StatusChanged { status, .. } if status == "running search"));
    }

    #[test]
    fn error_result_becomes_error_event() {
        let mut t = translator();
        let events = t.translate(&RuntimeMessage::failure(None, "No conversation found with session ID: r-1"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "error");
        assert_eq!(t.errors().len(), 1);
    }

    #[test]
    fn final_result_used_when_no_text() {
        let mut t = translator();
        t.translate(&RuntimeMessage::success("r", "All done."));
        assert_eq!(t.text(), "All done.");
        assert!(t.errors().is_empty());
    }

    #[test]
    fn ignores_system_and_unknown() {
        let mut t = translator();
        assert!(t.translate(&RuntimeMessage::Unknown).is_empty());
        assert!(t.translate(&RuntimeMessage::init("r")).is_empty());
    }
}
