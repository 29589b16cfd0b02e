//! The external agent runtime: the stream-JSON message model, the
//! CLI-backed implementation and a scripted double.

pub mod cli;
pub mod error;
pub mod message;
pub mod mock;
pub mod runtime;

pub use cli::{CliConfig, CliRuntime};
pub use error::RuntimeError;
pub use message::{ContentBlock, MessageBody, MessageContent, RuntimeMessage};
pub use mock::{MockReply, MockRuntime, RecordedQuery};
pub use runtime::{AgentRuntime, QueryRequest, RuntimeStream};
