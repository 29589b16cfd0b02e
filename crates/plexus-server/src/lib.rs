pub mod error;
pub mod expiry;
pub mod http;
pub mod hub;
pub mod orchestrator;
pub mod server;
pub mod translate;

pub use error::OrchestratorError;
pub use expiry::is_session_expired;
pub use hub::EventHub;
pub use orchestrator::{QueryAccepted, QueryOrchestrator, QueryState};
pub use server::{start, ServerConfig, ServerHandle};
