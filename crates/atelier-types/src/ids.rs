//! Identifier newtypes.
//!
//! Runs, jobs and organizations are keyed by UUIDs minted at creation time.
//! Collaboration identifiers (documents, users, clients) are free-form
//! strings because they originate outside the core.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mint a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

uuid_id! {
    /// One user task from prompt to terminal state.
    RunId
}
uuid_id! {
    /// A pending-jobs queue entry referencing a run.
    JobId
}
uuid_id! {
    /// The billing subject: balances and ledger entries hang off this.
    OrgId
}

string_id! {
    /// A worker process identity, used in lease records.
    WorkerId
}
string_id! {
    /// A collaborative document.
    DocumentId
}
string_id! {
    /// An end user as seen by the collaboration gateway.
    UserId
}
string_id! {
    /// One WebSocket connection; a user may hold several.
    ClientId
}
