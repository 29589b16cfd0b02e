use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use plexus_core::ToolServerConfig;

use crate::error::RuntimeError;
use crate::message::RuntimeMessage;
use crate::runtime::{AgentRuntime, QueryRequest, RuntimeStream};

/// Pre-programmed behaviour for one `query` call.
pub enum MockReply {
    /// Yield these messages, then end.
    Stream(Vec<RuntimeMessage>),
    /// Yield these messages, then fail with a non-zero exit.
    Exit(Vec<RuntimeMessage>, Option<i32>, String),
    /// `query` itself fails.
    LaunchFailure(String),
    /// Sleep inside the stream, then behave like the inner reply.
    Delay(Duration, Box<MockReply>),
    /// Yield these messages, then stay open until cancelled.
    Hang(Vec<RuntimeMessage>),
}

impl MockReply {
    /// A complete successful turn under `remote_id`.
    pub fn text(remote_id: &str, text: &str) -> Self {
        Self::Stream(vec![
            RuntimeMessage::init(remote_id),
            RuntimeMessage::delta(text),
            RuntimeMessage::assistant_text(text),
            RuntimeMessage::success(remote_id, text),
        ])
    }

    /// The runtime refusing to resume a conversation it no longer has.
    pub fn expired(remote_id: &str) -> Self {
        Self::Stream(vec![RuntimeMessage::failure(
            None,
            &format!("No conversation found with session ID: {remote_id}"),
        )])
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// What the runtime was asked to do.
#[derive(Clone, Debug)]
pub struct RecordedQuery {
    pub prompt: String,
    pub resume: Option<String>,
    pub cwd: Option<PathBuf>,
    pub tool_servers: Vec<ToolServerConfig>,
    pub workers: Vec<String>,
}

/// Runtime double that answers from a queue of [`MockReply`]s.
#[derive(Default)]
pub struct MockRuntime {
    replies: Mutex<VecDeque<MockReply>>,
    queries: Mutex<Vec<RecordedQuery>>,
}

impl MockRuntime {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.queries.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.queries.lock().len()
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn query(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<RuntimeStream, RuntimeError> {
        self.queries.lock().push(RecordedQuery {
            prompt: request.prompt.clone(),
            resume: request.resume.clone(),
            cwd: request.cwd.clone(),
            tool_servers: request.tool_servers.clone(),
            workers: request.workers.iter().map(|w| w.plugin().to_string()).collect(),
        });
        let Some(mut reply) = self.replies.lock().pop_front() else {
            return Err(RuntimeError::Launch {
                binary: "mock".into(),
                message: format!("no reply scripted for call {}", self.call_count()),
            });
        };

        // Delays unroll here so a cancel during the wait is still honoured.
        let mut delay = Duration::ZERO;
        while let MockReply::Delay(d, inner) = reply {
            delay += d;
            reply = *inner;
        }
        if let MockReply::LaunchFailure(message) = reply {
            return Err(RuntimeError::Launch {
                binary: "mock".into(),
                message,
            });
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = tx.send(Err(RuntimeError::Cancelled)).await;
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
            let (messages, tail) = match reply {
                MockReply::Stream(messages) => (messages, None),
                MockReply::Exit(messages, code, stderr) => {
                    (messages, Some(RuntimeError::Exit { code, stderr }))
                }
                MockReply::Hang(messages) => (messages, Some(RuntimeError::Cancelled)),
                MockReply::LaunchFailure(_) | MockReply::Delay(..) => return,
            };
            let hang = matches!(tail, Some(RuntimeError::Cancelled));
            for message in messages {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(RuntimeError::Cancelled)).await;
                    return;
                }
                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            if hang {
                cancel.cancelled().await;
            }
            if let Some(err) = tail {
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
