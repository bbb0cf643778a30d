//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Session, correlation, and run identifiers are all UUID v7 (time-ordered)
//! so they sort by creation time in logs and recorded runs. Keeping them as
//! distinct types prevents a correlation id from being passed where a
//! session id is expected.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Identifier sent in the identify message so the simulation can tie
    /// commands from one client session together.
    SessionId
}

define_id! {
    /// Identifier correlating an outbound command with its acknowledgement.
    ///
    /// Unique while the command is outstanding.
    CorrelationId
}

define_id! {
    /// Identifier of one harness execution and its recorded run.
    RunId
}
