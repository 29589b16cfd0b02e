use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// String newtype with no generator of its own. Session ids are derived by
/// the store from the creation date and the session name.
macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        string_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

string_id!(SessionId);
branded_id!(QueryId, "qry");
branded_id!(MessageId, "msg");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_id_has_prefix() {
        let id = QueryId::new();
        assert!(id.as_str().starts_with("qry_"), "got: {id}");
    }

    #[test]
    fn message_id_has_prefix() {
        let id = MessageId::new();
        assert!(id.as_str().starts_with("msg_"), "got: {id}");
    }

    #[test]
    fn branded_ids_are_unique_and_monotonic() {
        let ids: Vec<QueryId> = (0..50).map(|_| QueryId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn session_id_preserves_raw_value() {
        let id = SessionId::from_raw("2026-10-16-release-notes");
        assert_eq!(id.as_str(), "2026-10-16-release-notes");
        assert_eq!(id.to_string(), "2026-10-16-release-notes");
    }

    #[test]
    fn session_id_serializes_transparently() {
        let id = SessionId::from_raw("2026-10-16-demo");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""2026-10-16-demo""#);
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_from_str() {
        let parsed: SessionId = "2026-10-16-demo".parse().unwrap();
        assert_eq!(parsed.as_str(), "2026-10-16-demo");
    }
}
