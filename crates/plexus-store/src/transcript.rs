use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use plexus_core::{MessageId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// One stored transcript entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sequence: i64,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<serde_json::Value>,
    pub timestamp: String,
}

/// A message not yet appended.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub tool_result: Option<serde_json::Value>,
}

impl NewMessage {
    fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(MessageRole::System, content)
    }

    /// A tool invocation, with its result when the runtime reported one.
    pub fn tool(
        name: impl Into<String>,
        input: serde_json::Value,
        result: Option<serde_json::Value>,
    ) -> Self {
        let name = name.into();
        Self {
            role: MessageRole::Tool,
            content: name.clone(),
            tool_name: Some(name),
            tool_input: Some(input),
            tool_result: result,
        }
    }
}

/// Append-only transcript storage.
pub struct TranscriptRepo {
    db: Database,
}

impl TranscriptRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message; sequence numbers are dense per session starting at 1.
    #[instrument(skip(self, message), fields(session_id = %session_id, role = %message.role))]
    pub fn append(
        &self,
        session_id: &SessionId,
        message: NewMessage,
    ) -> Result<TranscriptMessage, StoreError> {
        let id = MessageId::new();
        let timestamp = Utc::now().to_rfc3339();
        let tool_input = message.tool_input.as_ref().map(serde_json::to_string).transpose()?;
        let tool_result = message.tool_result.as_ref().map(serde_json::to_string).transpose()?;

        self.db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }

            let sequence: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO messages (id, session_id, sequence, role, content, tool_name, tool_input, tool_result, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    sequence,
                    message.role.as_str(),
                    message.content,
                    message.tool_name,
                    tool_input,
                    tool_result,
                    timestamp,
                ],
            )?;

            Ok(TranscriptMessage {
                id,
                session_id: session_id.clone(),
                sequence,
                role: message.role,
                content: message.content,
                tool_name: message.tool_name,
                tool_input: message.tool_input,
                tool_result: message.tool_result,
                timestamp,
            })
        })
    }

    /// Messages in append order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<TranscriptMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, sequence, role, content, tool_name, tool_input, tool_result, timestamp
                 FROM messages WHERE session_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_message(row)?);
            }
            Ok(out)
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<TranscriptMessage, StoreError> {
    let role: String = row_helpers::get(row, 3, "messages", "role")?;
    Ok(TranscriptMessage {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "messages", "session_id")?),
        sequence: row_helpers::get(row, 2, "messages", "sequence")?,
        role: row_helpers::parse_enum(&role, "messages", "role")?,
        content: row_helpers::get(row, 4, "messages", "content")?,
        tool_name: row_helpers::get_opt(row, 5, "messages", "tool_name")?,
        tool_input: row_helpers::parse_json_opt(
            row_helpers::get_opt(row, 6, "messages", "tool_input")?,
            "messages",
            "tool_input",
        )?,
        tool_result: row_helpers::parse_json_opt(
            row_helpers::get_opt(row, 7, "messages", "tool_result")?,
            "messages",
            "tool_result",
        )?,
        timestamp: row_helpers::get(row, 8, "messages", "timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;

    fn setup() -> (TranscriptRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("demo", &[]).unwrap();
        (TranscriptRepo::new(db), session.id)
    }

    #[test]
    fn append_assigns_dense_sequence() {
        let (repo, sid) = setup();
        let a = repo.append(&sid, NewMessage::user("hello")).unwrap();
        let b = repo.append(&sid, NewMessage::assistant("hi there")).unwrap();
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert!(a.id.as_str().starts_with("msg_"));
        assert_eq!(repo.count(&sid).unwrap(), 2);
    }

    #[test]
    fn tool_messages_keep_input_and_result() {
        let (repo, sid) = setup();
        repo.append(
            &sid,
            NewMessage::tool(
                "search",
                serde_json::json!({"q": "rust"}),
                Some(serde_json::json!([{"type": "text", "text": "3 hits"}])),
            ),
        )
        .unwrap();
        repo.append(&sid, NewMessage::tool("ping", serde_json::json!({}), None))
            .unwrap();

        let msgs = repo.list(&sid).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, MessageRole::Tool);
        assert_eq!(msgs[0].tool_name.as_deref(), Some("search"));
        assert_eq!(msgs[0].tool_input.as_ref().unwrap()["q"], "rust");
        assert_eq!(msgs[0].tool_result.as_ref().unwrap()[0]["text"], "3 hits");
        assert!(msgs[1].tool_result.is_none());
    }

    #[test]
    fn append_to_unknown_session_fails() {
        let (repo, _) = setup();
        let err = repo
            .append(&SessionId::from_raw("nope"), NewMessage::user("x"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn transcripts_are_per_session() {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let a = sessions.create("a", &[]).unwrap();
        let b = sessions.create("b", &[]).unwrap();
        let repo = TranscriptRepo::new(db);
        repo.append(&a.id, NewMessage::user("for a")).unwrap();
        repo.append(&b.id, NewMessage::system("for b")).unwrap();
        repo.append(&b.id, NewMessage::user("again b")).unwrap();

        assert_eq!(repo.list(&a.id).unwrap().len(), 1);
        let b_msgs = repo.list(&b.id).unwrap();
        assert_eq!(b_msgs[0].role, MessageRole::System);
        assert_eq!(b_msgs[1].sequence, 2);
    }

    #[test]
    fn role_parse_roundtrip() {
        for role in [
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::System,
        ] {
            assert_eq!(role.as_str().parse::<MessageRole>().unwrap(), role);
        }
        assert!("robot".parse::<MessageRole>().is_err());
    }
}
