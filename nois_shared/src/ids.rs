//! Opaque 128-bit identifiers used across the engine and the wire protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn nil() -> Self {
                Self(Uuid::nil())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id! {
    /// Identifies a participant in a collaboration session.
    ///
    /// Ordered (byte-wise on the underlying UUID) so that concurrent edits
    /// can be tie-broken identically on every peer.
    PeerId
}
uuid_id! {
    /// Identifies one collaboration session.
    SessionId
}
uuid_id! {
    /// Identifies a single wire message.
    MessageId
}
uuid_id! {
    /// Identifies one edit operation.
    OperationId
}
uuid_id! {
    /// Identifies a shared entity: track, clip, pattern, note or voicing.
    EntityId
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}
