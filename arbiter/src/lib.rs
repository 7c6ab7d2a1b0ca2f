#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Lease-based ownership arbitration ("virtual baton").
//!
//! Independent participants agree on a single owner of a shared resource by
//! writing short-lived lease tokens into an eventually-consistent object store
//! and applying the same deterministic tie-break to whatever they can see.
//! There is no RPC between participants and no lock server: a crashed owner is
//! recovered from purely by the store expiring its token.

pub mod config;
pub mod error;
pub mod machine;
pub mod scheduler;
pub mod store;
pub mod tiebreak;
pub mod token;

pub mod test_utils;

pub use config::{ArbiterConfig, Hooks, OwnershipCallback};
pub use error::{Error, Result};
pub use machine::{Arbiter, ArbiterState, ArmedTimer, Baton, Timer};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use store::{InMemoryStore, ObjectStore, StoreStats};
pub use tiebreak::{Lexicographic, TieBreak};
pub use token::{ChildEntry, ChildId, LeaseToken, NameGenerator, UuidNames};

use serde::{Deserialize, Serialize};

/// Stable identifier of the logical resource a lease protects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
