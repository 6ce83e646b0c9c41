//! Newtype wrappers for identifiers to ensure type safety.
//!
//! Every identifier is an opaque string owned by the backend. Units are
//! additionally addressed by sequence number inside a project, but the
//! sequence number is a position, not an identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
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
    };
}

string_id!(
    /// Identifier of a writing project (the scope of sequence numbers).
    ProjectId
);

string_id!(
    /// Identifier of a unit (chapter).
    UnitId
);

string_id!(
    /// Identifier of a server-side batch generation job.
    BatchId
);

string_id!(
    /// Identifier of an analysis job run by the analysis service.
    AnalysisTaskId
);
