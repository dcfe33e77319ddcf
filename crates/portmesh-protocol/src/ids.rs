//! Canonical ID types for portmesh.
//!
//! IDs are opaque String wrappers (serde-transparent). Event ids double as
//! namespace roots for virtualized sub-channels (`<event_id>:<index>`) and
//! for replication streams (`<event_id>.mutate`), so they are kept printable.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identity of one port instance. Used for echo suppression and dedupe,
    /// never as an ownership handle.
    PortId
);
typed_id!(
    /// Identifier of one logical request or stream.
    EventId
);

fn short_uuid() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[..12].to_owned()
}

impl PortId {
    /// Fresh random port identity.
    pub fn generate() -> Self {
        Self(format!("port-{}", short_uuid()))
    }
}

impl EventId {
    /// Fresh event id rooted at the event type, e.g. `message-3f9c0a1b2d4e`.
    pub fn for_type(event_type: &str) -> Self {
        Self(format!("{event_type}-{}", short_uuid()))
    }

    /// Namespace carrying the traffic of the `index`-th virtualized sub-channel.
    pub fn sub_channel_namespace(&self, index: usize) -> String {
        format!("{}:{index}", self.0)
    }

    /// Event type carrying the replication batches of this stream.
    pub fn mutate_type(&self) -> String {
        format!("{}{}", self.0, crate::envelope::MUTATE_SUFFIX)
    }
}

/// Participant identity announced by broadcast clients, e.g. `client-8a1f03b2c4d5`.
pub fn client_identity() -> String {
    format!("client-{}", short_uuid())
}
