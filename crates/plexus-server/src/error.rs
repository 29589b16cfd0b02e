use plexus_core::SessionId;
use plexus_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session {0} already has a query in flight")]
    Conflict(SessionId),

    /// The turn task ended before deciding whether to accept the query.
    #[error("query for session {0} was aborted before it was accepted")]
    Aborted(SessionId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Aborted(_) => "aborted",
            Self::Store(_) => "store",
        }
    }
}
