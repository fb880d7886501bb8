//! Branded ID newtypes.
//!
//! A turn id travels on the wire as `query_id`, a conversation id as
//! `session_id`. Keeping them as distinct types prevents handing a
//! conversation id to an API keyed by turn.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

branded_id! {
    /// Client-generated identifier for one request/response cycle.
    ///
    /// Sent to the server as `query_id`.
    TurnId
}

branded_id! {
    /// Identifier of the conversation that owns a turn.
    ///
    /// Sent to the server as `session_id`. May be corrected mid-turn by
    /// `session_created` or replaced by `session_renewed`.
    ConversationId
}

branded_id! {
    /// Identifier of an assistant message (one per document).
    MessageId
}

impl TurnId {
    /// Generate a turn id in the server's format: `query_<epoch-ms>_<8 hex>`.
    #[must_use]
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("query_{millis}_{}", &suffix[..8]))
    }
}

impl ConversationId {
    /// Generate a new conversation id (UUID v4, the format the server persists).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl MessageId {
    /// Generate a new message id (UUID v7, time-ordered).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_id_matches_server_format() {
        let id = TurnId::generate();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "query");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn turn_ids_are_unique() {
        assert_ne!(TurnId::generate(), TurnId::generate());
    }

    #[test]
    fn conversation_id_is_uuid() {
        let id = ConversationId::generate();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn serde_is_transparent() {
        let id = ConversationId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let back: ConversationId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn compares_with_str() {
        let id = TurnId::from("query_1_deadbeef");
        assert!(id == "query_1_deadbeef");
        assert_eq!(&*id, "query_1_deadbeef");
    }
}
