use plexus_core::TransportError;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no free ports left in {start}..={end}")]
pub struct PortsExhausted {
    pub start: u16,
    pub end: u16,
}

/// Failures while bringing a plugin process up.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{plugin}: gave up after {attempts} attempts, every port collided")]
    PortCollisions { plugin: String, attempts: u32 },

    #[error("{plugin}: handshake on port {port} failed: {message}{}", stderr_suffix(.stderr))]
    Handshake {
        plugin: String,
        port: u16,
        message: String,
        stderr: String,
    },

    #[error("{plugin}: failed to launch `{command}`: {message}")]
    Launch {
        plugin: String,
        command: String,
        message: String,
    },

    /// A ledger process could not be adopted.
    #[error("{plugin}: cannot reconnect to pid {pid}: {message}")]
    Reconnect {
        plugin: String,
        pid: u32,
        message: String,
    },

    #[error(transparent)]
    Ports(#[from] PortsExhausted),
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("; stderr: {trimmed}")
    }
}

impl SupervisorError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::PortCollisions { .. } => "port_collisions",
            Self::Handshake { .. } => "handshake",
            Self::Launch { .. } => "launch",
            Self::Reconnect { .. } => "reconnect",
            Self::Ports(_) => "ports_exhausted",
        }
    }
}

/// Errors surfaced by the lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error(transparent)]
    PortsExhausted(#[from] PortsExhausted),

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    /// Invalid manifest or otherwise not launchable.
    #[error("plugin {plugin} is unavailable: {reason}")]
    Unavailable { plugin: String, reason: String },

    #[error("plugin {0} is not running")]
    NotRunning(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl PluginError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::PortsExhausted(_) => "ports_exhausted",
            Self::UnknownPlugin(_) => "unknown_plugin",
            Self::Unavailable { .. } => "unavailable",
            Self::NotRunning(_) => "not_running",
            Self::Supervisor(e) => e.error_kind(),
            Self::Transport(e) => e.error_kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_error_names_ceiling() {
        let err = SupervisorError::PortCollisions {
            plugin: "notes".into(),
            attempts: 10,
        };
        assert_eq!(err.to_string(), "notes: gave up after 10 attempts, every port collided");
    }

    #[test]
    fn handshake_error_includes_stderr_tail() {
        let err = SupervisorError::Handshake {
            plugin: "notes".into(),
            port: 50001,
            message: "connection refused".into(),
            stderr: "Error: missing API key\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("port 50001"));
        assert!(msg.ends_with("stderr: Error: missing API key"), "got: {msg}");

        let quiet = SupervisorError::Handshake {
            plugin: "notes".into(),
            port: 50001,
            message: "timed out".into(),
            stderr: "  ".into(),
        };
        assert!(!quiet.to_string().contains("stderr"));
    }

    #[test]
    fn ports_exhausted_converts_both_ways() {
        let exhausted = PortsExhausted { start: 1, end: 2 };
        let sup: SupervisorError = exhausted.clone().into();
        assert_eq!(sup.error_kind(), "ports_exhausted");
        let plugin: PluginError = exhausted.into();
        assert_eq!(plugin.to_string(), "no free ports left in 1..=2");
    }
}
