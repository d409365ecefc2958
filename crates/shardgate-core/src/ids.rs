//! Branded ID newtypes.
//!
//! Correlation ids, client ids, account ids and shard ids all travel as
//! plain strings on the wire. Wrapping each in its own type keeps a client id
//! from being passed where a correlation id is expected.
//!
//! Generated ids are UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
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

        impl Default for $name {
            fn default() -> Self {
                Self::new()
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
    };
}

branded_id! {
    /// Links an outgoing request to its eventual response across transports.
    CorrelationId
}

branded_id! {
    /// Stable identity of an authenticated client, assigned at handshake.
    ClientId
}

branded_id! {
    /// Identity of a single physical WebSocket connection.
    ///
    /// Distinct from [`ClientId`]: a client that reconnects keeps its client
    /// id but gets a new connection id.
    ConnectionId
}

branded_id! {
    /// Player account bound to a shard.
    AccountId
}

branded_id! {
    /// Capacity-limited backend partition.
    ShardId
}

branded_id! {
    /// Distributed trace identifier.
    TraceId
}

branded_id! {
    /// Span identifier within a trace.
    SpanId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_parse_as_uuid() {
        let id = ClientId::new();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn serializes_transparently() {
        let id = ShardId::from("shard-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"shard-7\"");
        let back: ShardId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_and_deref_expose_inner_value() {
        let id = AccountId::from("acct-1");
        assert_eq!(id.to_string(), "acct-1");
        assert!(id.starts_with("acct"));
        assert_eq!(String::from(id), "acct-1");
    }

    #[test]
    fn ids_order_lexicographically() {
        let mut ids = vec![ShardId::from("b"), ShardId::from("a")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "a");
    }
}
