//! Plugin subprocess hosting: port leasing, process supervision, the pid
//! ledger used to reconnect after a restart, and the lifecycle manager that
//! shares one process per plugin across sessions.

pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod manifest;
pub mod mock;
pub mod ports;
pub mod record;
pub mod stderr;
pub mod supervisor;
pub mod transport;

pub use dispatch::DispatchAdapter;
pub use error::{PluginError, PortsExhausted, SupervisorError};
pub use ledger::{Ledger, LedgerEntry, PidFileLedger};
pub use manager::{PluginManager, StartReport};
pub use manifest::{discover, PluginManifest};
pub use ports::PortAllocator;
pub use record::{Capability, PluginRecord, PluginStatus};
pub use supervisor::{
    ExitReport, LaunchSpec, Launched, Launcher, PluginProcess, Supervisor, SupervisorConfig,
};
pub use transport::{JsonRpcClient, RpcTimeouts};
