use plexus_core::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::sessions::{SessionMetadata, SessionRepo, SessionUpdate};
use crate::transcript::{NewMessage, TranscriptMessage, TranscriptRepo};

/// Session metadata, transcript and notes behind one handle.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn sessions(&self) -> SessionRepo {
        SessionRepo::new(self.db.clone())
    }

    fn transcript(&self) -> TranscriptRepo {
        TranscriptRepo::new(self.db.clone())
    }

    pub fn create_session(&self, name: &str, plugins: &[String]) -> Result<SessionMetadata, StoreError> {
        self.sessions().create(name, plugins)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        self.sessions().list()
    }

    pub fn get_session(&self, id: &SessionId) -> Result<SessionMetadata, StoreError> {
        self.sessions().get(id)
    }

    pub fn update_metadata(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<SessionMetadata, StoreError> {
        self.sessions().update(id, update)
    }

    pub fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions().delete(id)
    }

    pub fn append_message(
        &self,
        id: &SessionId,
        message: NewMessage,
    ) -> Result<TranscriptMessage, StoreError> {
        self.transcript().append(id, message)
    }

    pub fn messages(&self, id: &SessionId) -> Result<Vec<TranscriptMessage>, StoreError> {
        self.transcript().list(id)
    }

    pub fn notes(&self, id: &SessionId) -> Result<String, StoreError> {
        self.sessions().notes(id)
    }

    pub fn write_notes(&self, id: &SessionId, text: &str) -> Result<(), StoreError> {
        self.sessions().write_notes(id, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::SessionStatus;

    #[test]
    fn full_session_lifecycle() {
        let store = SessionStore::new(Database::in_memory().unwrap());
        let meta = store
            .create_session("Planning", &["notes".into(), "calendar".into()])
            .unwrap();

        store.append_message(&meta.id, NewMessage::user("plan my week")).unwrap();
        store.write_notes(&meta.id, "draft").unwrap();
        store
            .update_metadata(&meta.id, SessionUpdate::status(SessionStatus::Running))
            .unwrap();

        assert_eq!(store.get_session(&meta.id).unwrap().status, SessionStatus::Running);
        assert_eq!(store.messages(&meta.id).unwrap().len(), 1);
        assert_eq!(store.notes(&meta.id).unwrap(), "draft");
        assert_eq!(store.list_sessions().unwrap().len(), 1);

        store.delete_session(&meta.id).unwrap();
        assert!(store.list_sessions().unwrap().is_empty());
        assert!(store.messages(&meta.id).unwrap().is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plexus.db");
        let id = {
            let store = SessionStore::new(Database::open(&path).unwrap());
            let meta = store.create_session("durable", &[]).unwrap();
            store.append_message(&meta.id, NewMessage::assistant("saved")).unwrap();
            meta.id
        };

        let store = SessionStore::new(Database::open(&path).unwrap());
        let msgs = store.messages(&id).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "saved");
    }
}
