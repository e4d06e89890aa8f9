//! Typed identifiers for every record kind the store persists.
//!
//! Plain `String` ids are easy to swap by accident at a call site (passing a
//! session id where a task id belongs compiles silently). Newtypes close that
//! hole while staying free to construct, serialize, and hash.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh, timestamp-prefixed id so ids sort approximately
            /// in creation order even though they are not strictly monotonic.
            #[must_use]
            pub fn generate() -> Self {
                let now = chrono::Utc::now().timestamp_millis();
                let suffix = Uuid::new_v4().simple().to_string();
                Self(format!("{}{now}-{}", $prefix, &suffix[..12]))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[must_use]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_newtype!(TaskId, "task-");
id_newtype!(SessionId, "session-");
id_newtype!(CheckpointId, "checkpoint-");
id_newtype!(AuditEntryId, "audit-");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert!(a.as_str().starts_with("task-"));
        assert_ne!(a, b);
    }

    #[test]
    fn round_trips_through_json() {
        let id = SessionId::from("session-fixed");
        let json = serde_json::to_string(&id).unwrap();
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
