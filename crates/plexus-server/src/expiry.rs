/// Whether an error reported by the agent runtime means the remote
/// conversation can no longer be resumed.
pub fn is_session_expired(message: &str) -> bool {
    let lower = message.to_lowercase();
    (lower.contains("session") && lower.contains("expired"))
        || lower.contains("no conversation found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_expiry_phrasings() {
        assert!(is_session_expired("Session expired, please start over"));
        assert!(is_session_expired("the SESSION has EXPIRED"));
        assert!(is_session_expired("No conversation found with session ID: 4f1c"));
    }

    #[test]
    fn ignores_unrelated_errors() {
        assert!(!is_session_expired("rate limited"));
        assert!(!is_session_expired("token expired"));
        assert!(!is_session_expired("session not found"));
        assert!(!is_session_expired(""));
    }
}
