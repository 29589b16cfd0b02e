pub mod errors;
pub mod events;
pub mod ids;
pub mod session;
pub mod tail;
pub mod tools;

pub use errors::TransportError;
pub use events::{PluginEvent, QueryEvent};
pub use ids::{MessageId, QueryId, SessionId};
pub use session::SessionStatus;
pub use tail::TailBuffer;
pub use tools::{ToolDefinition, ToolServerConfig, WorkerDispatch};
