use crate::{
    token::{ChildEntry, ChildId},
    Error, ResourceId, Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::{Duration, Instant};

/// Adapter over the shared, eventually-consistent object store.
///
/// The store offers no atomic check-and-create: two participants can both see
/// an empty child set and both create a token in the same window. Everything
/// above this trait is built around that.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Children of `resource` currently visible to this reader, in no
    /// particular order. Expired children may be omitted.
    async fn list_children(&self, resource: &ResourceId) -> Result<Vec<ChildEntry>>;

    /// Creates a child named `name` that the store deletes once its age
    /// reaches `ttl`.
    async fn create_child(&self, resource: &ResourceId, name: &str, ttl: Duration) -> Result<ChildId>;

    /// Deleting an absent child is a no-op.
    async fn delete_child(&self, id: ChildId) -> Result<()>;

    /// Replaces the child's total lifetime. No-op if the child is gone.
    async fn renew_child(&self, id: ChildId, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredChild {
    resource: ResourceId,
    name: String,
    created_at: Instant,
    lifetime: Duration,
}

impl StoredChild {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.age(now) >= self.lifetime
    }

    fn entry(&self, id: ChildId, now: Instant) -> ChildEntry {
        ChildEntry {
            id,
            name: self.name.clone(),
            age: self.age(now),
        }
    }
}

/// Snapshot of how many calls a store has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub lists: u64,
    pub creates: u64,
    pub deletes: u64,
    pub renews: u64,
}

#[derive(Debug, Default)]
struct OpCounters {
    lists: AtomicU64,
    creates: AtomicU64,
    deletes: AtomicU64,
    renews: AtomicU64,
}

/// Simulated replicated store shared by every participant in a process.
///
/// Creations become visible to readers only after `propagation_delay`; deletes
/// and renewals apply immediately. The store enforces TTLs on its own, without
/// any participant's help.
#[derive(Debug)]
pub struct InMemoryStore {
    children: DashMap<ChildId, StoredChild>,
    propagation_delay: Duration,
    failing: AtomicBool,
    renewal_failures: AtomicU64,
    counters: OpCounters,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_propagation_delay(Duration::ZERO)
    }

    pub fn with_propagation_delay(propagation_delay: Duration) -> Self {
        Self {
            children: DashMap::new(),
            propagation_delay,
            failing: AtomicBool::new(false),
            renewal_failures: AtomicU64::new(0),
            counters: OpCounters::default(),
        }
    }

    pub fn propagation_delay(&self) -> Duration {
        self.propagation_delay
    }

    /// While set, every call fails with `Error::Store`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fails the next `count` renewals while every other call keeps working.
    pub fn fail_next_renewals(&self, count: u64) {
        self.renewal_failures.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            lists: self.counters.lists.load(Ordering::SeqCst),
            creates: self.counters.creates.load(Ordering::SeqCst),
            deletes: self.counters.deletes.load(Ordering::SeqCst),
            renews: self.counters.renews.load(Ordering::SeqCst),
        }
    }

    /// Every unexpired child of `resource`, visible or not yet propagated.
    pub fn live_children(&self, resource: &ResourceId) -> Vec<ChildEntry> {
        let now = Instant::now();
        self.purge_expired(now);
        self.children
            .iter()
            .filter(|entry| &entry.value().resource == resource)
            .map(|entry| entry.value().entry(*entry.key(), now))
            .collect()
    }

    fn purge_expired(&self, now: Instant) {
        self.children.retain(|id, child| {
            let keep = !child.is_expired(now);
            if !keep {
                tracing::debug!(resource = %child.resource, child = %id, name = %child.name, "ttl elapsed, child removed");
            }
            keep
        });
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::store("object store unavailable"));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn list_children(&self, resource: &ResourceId) -> Result<Vec<ChildEntry>> {
        self.counters.lists.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let now = Instant::now();
        self.purge_expired(now);
        Ok(self
            .children
            .iter()
            .filter(|entry| &entry.value().resource == resource)
            .filter(|entry| entry.value().age(now) >= self.propagation_delay)
            .map(|entry| entry.value().entry(*entry.key(), now))
            .collect())
    }

    async fn create_child(&self, resource: &ResourceId, name: &str, ttl: Duration) -> Result<ChildId> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let now = Instant::now();
        self.purge_expired(now);
        let id = ChildId::new();
        self.children.insert(
            id,
            StoredChild {
                resource: resource.clone(),
                name: name.to_string(),
                created_at: now,
                lifetime: ttl,
            },
        );
        Ok(id)
    }

    async fn delete_child(&self, id: ChildId) -> Result<()> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        self.children.remove(&id);
        Ok(())
    }

    async fn renew_child(&self, id: ChildId, ttl: Duration) -> Result<()> {
        self.counters.renews.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let injected = self
            .renewal_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::store("renewal rejected"));
        }

        let now = Instant::now();
        self.purge_expired(now);
        if let Some(mut child) = self.children.get_mut(&id) {
            child.lifetime = ttl;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> ResourceId {
        ResourceId::from("fishtank")
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_list() {
        let store = InMemoryStore::new();
        let id = store
            .create_child(&resource(), "baton-a", Duration::from_secs(5))
            .await
            .unwrap();

        let children = store.list_children(&resource()).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, id);
        assert_eq!(children[0].name, "baton-a");

        // Other resources are not mixed in
        assert!(store.list_children(&ResourceId::from("other")).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_children_expire_without_help() {
        let store = InMemoryStore::new();
        store
            .create_child(&resource(), "baton-a", Duration::from_millis(500))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(499)).await;
        assert_eq!(store.list_children(&resource()).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.list_children(&resource()).await.unwrap().is_empty());
        assert!(store.live_children(&resource()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_visible_after_propagation_delay() {
        let store = InMemoryStore::with_propagation_delay(Duration::from_millis(200));
        store
            .create_child(&resource(), "baton-a", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(store.list_children(&resource()).await.unwrap().is_empty());
        assert_eq!(store.live_children(&resource()).len(), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(store.list_children(&resource()).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_overwrites_lifetime() {
        let store = InMemoryStore::new();
        let id = store
            .create_child(&resource(), "baton-a", Duration::from_millis(1_000))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(800)).await;
        store.renew_child(id, Duration::from_millis(3_000)).await.unwrap();

        tokio::time::advance(Duration::from_millis(2_000)).await;
        let children = store.list_children(&resource()).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].age, Duration::from_millis(2_800));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(store.list_children(&resource()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_renew_missing_are_noops() {
        let store = InMemoryStore::new();
        let id = store
            .create_child(&resource(), "baton-a", Duration::from_secs(5))
            .await
            .unwrap();

        store.delete_child(id).await.unwrap();
        store.delete_child(id).await.unwrap();
        store.renew_child(id, Duration::from_secs(5)).await.unwrap();

        assert!(store.list_children(&resource()).await.unwrap().is_empty());
        let stats = store.stats();
        assert_eq!(stats.deletes, 2);
        assert_eq!(stats.renews, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_store_rejects_calls() {
        let store = InMemoryStore::new();
        store.set_failing(true);

        let result = store.create_child(&resource(), "baton-a", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert!(store.list_children(&resource()).await.is_err());

        store.set_failing(false);
        assert!(store.list_children(&resource()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_next_renewals_only_hits_renewals() {
        let store = InMemoryStore::new();
        let id = store
            .create_child(&resource(), "baton-a", Duration::from_secs(5))
            .await
            .unwrap();
        store.fail_next_renewals(2);

        assert!(store.renew_child(id, Duration::from_secs(10)).await.is_err());
        assert_eq!(store.list_children(&resource()).await.unwrap().len(), 1);
        assert!(store.renew_child(id, Duration::from_secs(10)).await.is_err());
        store.renew_child(id, Duration::from_secs(10)).await.unwrap();

        assert_eq!(store.stats().renews, 3);
    }
}
