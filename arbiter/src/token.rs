use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Store-assigned identifier of a child object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChildId(pub Uuid);

impl ChildId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One entry of a `list_children` answer, as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub id: ChildId,
    pub name: String,
    /// Time since the store created the child.
    pub age: Duration,
}

/// A lease token issued by this process while contesting or holding a resource.
///
/// Lifetime is measured from creation, the same way the store measures it, so
/// extending a lease means asking for `age + extension`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub id: ChildId,
    pub name: String,
    pub created_at: Instant,
    pub lifetime: Duration,
    pub renewal_count: u32,
}

impl LeaseToken {
    pub fn new(id: ChildId, name: String, created_at: Instant, lifetime: Duration) -> Self {
        Self {
            id,
            name,
            created_at,
            lifetime,
            renewal_count: 0,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn expires_at(&self) -> Instant {
        self.created_at + self.lifetime
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    pub fn time_remaining(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }

    /// Lifetime that keeps the token alive for `extension` past `now`.
    pub fn extended_lifetime(&self, now: Instant, extension: Duration) -> Duration {
        self.age(now) + extension
    }

    pub fn renew(&mut self, lifetime: Duration) {
        self.lifetime = lifetime;
        self.renewal_count += 1;
    }
}

/// Produces candidate token names.
///
/// Names only need to be distinct across concurrent candidates with
/// overwhelming probability; ordering among them is the tie-break's business.
pub trait NameGenerator: Send + Sync {
    fn generate(&self, prefix: &str) -> String;
}

/// Default generator: the prefix followed by a random UUID in simple hex form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidNames;

impl NameGenerator for UuidNames {
    fn generate(&self, prefix: &str) -> String {
        format!("{prefix}{}", Uuid::new_v4().simple())
    }
}

impl<F> NameGenerator for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn generate(&self, prefix: &str) -> String {
        self(prefix)
    }
}
