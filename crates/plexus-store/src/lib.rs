pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod slug;
pub mod store;
pub mod transcript;

pub use database::Database;
pub use error::StoreError;
pub use sessions::{SessionMetadata, SessionRepo, SessionUpdate};
pub use store::SessionStore;
pub use transcript::{MessageRole, NewMessage, TranscriptMessage, TranscriptRepo};
