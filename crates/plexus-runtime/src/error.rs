#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to launch agent runtime `{binary}`: {message}")]
    Launch { binary: String, message: String },

    #[error("agent runtime I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent runtime exited with {}{}", exit_code(.code), stderr_suffix(.stderr))]
    Exit { code: Option<i32>, stderr: String },

    #[error("query cancelled")]
    Cancelled,
}

impl RuntimeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_message_carries_stderr() {
        let err = RuntimeError::Exit {
            code: Some(1),
            stderr: "Error: No conversation found with session ID: abc\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "agent runtime exited with code 1: Error: No conversation found with session ID: abc"
        );
        let killed = RuntimeError::Exit {
            code: None,
            stderr: String::new(),
        };
        assert_eq!(killed.to_string(), "agent runtime exited with a signal");
    }
}
