use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use plexus_core::{ToolServerConfig, WorkerDispatch};

use crate::error::RuntimeError;
use crate::message::RuntimeMessage;

pub type RuntimeStream = Pin<Box<dyn Stream<Item = Result<RuntimeMessage, RuntimeError>> + Send>>;

/// One conversation turn handed to the runtime.
#[derive(Clone, Default)]
pub struct QueryRequest {
    pub prompt: String,
    /// Remote conversation to continue; `None` starts fresh.
    pub resume: Option<String>,
    pub cwd: Option<PathBuf>,
    pub tool_servers: Vec<ToolServerConfig>,
    pub workers: Vec<Arc<dyn WorkerDispatch>>,
}

impl std::fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRequest")
            .field("prompt_len", &self.prompt.len())
            .field("resume", &self.resume)
            .field("cwd", &self.cwd)
            .field("tool_servers", &self.tool_servers)
            .field(
                "workers",
                &self.workers.iter().map(|w| w.plugin()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// The external agent that actually runs a turn.
///
/// The returned stream ends when the turn ends. Cancelling `cancel` must
/// stop the underlying work and end the stream with
/// [`RuntimeError::Cancelled`].
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn name(&self) -> &str;

    async fn query(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<RuntimeStream, RuntimeError>;
}
