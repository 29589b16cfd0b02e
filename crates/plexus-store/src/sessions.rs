use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use plexus_core::{SessionId, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::slug;

const SELECT_COLUMNS: &str = "SELECT id, name, status, plugins, remote_session_id, turn_count,
        created_at, updated_at, last_activity_at FROM sessions";

/// Durable metadata for one conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    pub plugins: Vec<String>,
    /// Remote conversation id used to resume the agent runtime.
    pub remote_session_id: Option<String>,
    pub turn_count: u32,
    pub created_at: String,
    pub updated_at: String,
    pub last_activity_at: String,
}

impl SessionMetadata {
    /// A turn resumes only with a recorded remote id on a non-expired session.
    pub fn resume_id(&self) -> Option<&str> {
        match self.status {
            SessionStatus::Expired => None,
            _ => self.remote_session_id.as_deref(),
        }
    }
}

/// Mutable fields of [`SessionMetadata`]. `id` and `created_at` are absent
/// on purpose; they never change after creation.
#[derive(Clone, Debug, Default)]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub status: Option<SessionStatus>,
    pub plugins: Option<Vec<String>>,
    /// `Some(None)` clears the stored id.
    pub remote_session_id: Option<Option<String>>,
    pub turn_count: Option<u32>,
    pub last_activity_at: Option<String>,
}

impl SessionUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    fn apply(self, meta: &mut SessionMetadata) {
        if let Some(name) = self.name {
            meta.name = name;
        }
        if let Some(status) = self.status {
            meta.status = status;
        }
        if let Some(plugins) = self.plugins {
            meta.plugins = plugins;
        }
        if let Some(remote) = self.remote_session_id {
            meta.remote_session_id = remote;
        }
        if let Some(turns) = self.turn_count {
            meta.turn_count = turns;
        }
        if let Some(at) = self.last_activity_at {
            meta.last_activity_at = at;
        }
    }
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a session with a collision-free date-and-slug id, plus its
    /// empty notes document.
    #[instrument(skip(self, plugins))]
    pub fn create(&self, name: &str, plugins: &[String]) -> Result<SessionMetadata, StoreError> {
        self.create_at(name, plugins, Utc::now())
    }

    pub fn create_at(
        &self,
        name: &str,
        plugins: &[String],
        now: DateTime<Utc>,
    ) -> Result<SessionMetadata, StoreError> {
        let base = slug::base_id(now.date_naive(), name);
        let stamp = now.to_rfc3339();
        let plugins_json = serde_json::to_string(plugins)?;

        self.db.with_conn(|conn| {
            let mut n = 1;
            let id = loop {
                let candidate = slug::candidate(&base, n);
                let taken: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                    [&candidate],
                    |row| row.get(0),
                )?;
                if !taken {
                    break candidate;
                }
                n += 1;
            };

            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO sessions (id, name, status, plugins, turn_count, created_at, updated_at, last_activity_at)
                 VALUES (?1, ?2, 'idle', ?3, 0, ?4, ?4, ?4)",
                rusqlite::params![id, name, plugins_json, stamp],
            )?;
            tx.execute(
                "INSERT INTO notes (session_id, content, updated_at) VALUES (?1, '', ?2)",
                rusqlite::params![id, stamp],
            )?;
            tx.commit()?;

            Ok(SessionMetadata {
                id: SessionId::from_raw(id),
                name: name.to_string(),
                status: SessionStatus::Idle,
                plugins: plugins.to_vec(),
                remote_session_id: None,
                turn_count: 0,
                created_at: stamp.clone(),
                updated_at: stamp.clone(),
                last_activity_at: stamp,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionMetadata, StoreError> {
        self.db.with_conn(|conn| fetch(conn, id))
    }

    /// All sessions, newest first. Rows that fail to decode are skipped.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("{SELECT_COLUMNS} ORDER BY created_at DESC, id DESC");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                match row_to_session(row) {
                    Ok(meta) => results.push(meta),
                    Err(e) => {
                        let id: Option<String> = row.get(0).ok();
                        warn!(session_id = ?id, error = %e, "skipping corrupt session row");
                    }
                }
            }
            Ok(results)
        })
    }

    /// Apply an update and return the stored result.
    #[instrument(skip(self, update), fields(session_id = %id))]
    pub fn update(&self, id: &SessionId, update: SessionUpdate) -> Result<SessionMetadata, StoreError> {
        self.db.with_conn(|conn| {
            let mut meta = fetch(conn, id)?;
            update.apply(&mut meta);
            meta.updated_at = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET name = ?1, status = ?2, plugins = ?3, remote_session_id = ?4,
                        turn_count = ?5, updated_at = ?6, last_activity_at = ?7
                 WHERE id = ?8",
                rusqlite::params![
                    meta.name,
                    meta.status.as_str(),
                    serde_json::to_string(&meta.plugins)?,
                    meta.remote_session_id,
                    meta.turn_count,
                    meta.updated_at,
                    meta.last_activity_at,
                    id.as_str(),
                ],
            )?;
            Ok(meta)
        })
    }

    /// Hard delete, including transcript and notes.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM notes WHERE session_id = ?1", [id.as_str()])?;
            let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            tx.commit()?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    pub fn notes(&self, id: &SessionId) -> Result<String, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT content FROM notes WHERE session_id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_helpers::get(row, 0, "notes", "content"),
                None => Err(StoreError::NotFound(format!("notes for session {id}"))),
            }
        })
    }

    #[instrument(skip(self, content), fields(session_id = %id, len = content.len()))]
    pub fn write_notes(&self, id: &SessionId, content: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                [id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            conn.execute(
                "INSERT INTO notes (session_id, content, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
                rusqlite::params![id.as_str(), content, now],
            )?;
            Ok(())
        })
    }
}

fn fetch(conn: &rusqlite::Connection, id: &SessionId) -> Result<SessionMetadata, StoreError> {
    let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::NotFound(format!("session {id}"))),
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionMetadata, StoreError> {
    let status: String = row_helpers::get(row, 2, "sessions", "status")?;
    let plugins: String = row_helpers::get(row, 3, "sessions", "plugins")?;

    Ok(SessionMetadata {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        name: row_helpers::get(row, 1, "sessions", "name")?,
        status: row_helpers::parse_enum(&status, "sessions", "status")?,
        plugins: row_helpers::parse_json(&plugins, "sessions", "plugins")?,
        remote_session_id: row_helpers::get_opt(row, 4, "sessions", "remote_session_id")?,
        turn_count: row_helpers::get(row, 5, "sessions", "turn_count")?,
        created_at: row_helpers::get(row, 6, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 7, "sessions", "updated_at")?,
        last_activity_at: row_helpers::get(row, 8, "sessions", "last_activity_at")?,
    })
}
