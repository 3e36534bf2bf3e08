//! Cache store capability and the in-process memory tier.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::cache::entry::CacheEntry;
use crate::cache::error::CacheError;
use crate::time::TimeProvider;

/// A single cache tier.
///
/// Implementations are swappable at construction; the canonical chain is
/// `[memory, optional shared store]`. All methods are infallible for the
/// memory tier but the trait is fallible so remote tiers fit the same slot.
#[async_trait]
pub trait CacheStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Tier name for logs.
    fn name(&self) -> &'static str;

    /// Fetch an entry. Expired entries are reported as absent.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry<V>>, CacheError>;

    /// Store an entry.
    async fn set(&self, namespace: &str, key: &str, entry: CacheEntry<V>) -> Result<(), CacheError>;

    /// Remove an entry.
    async fn remove(&self, namespace: &str, key: &str) -> Result<(), CacheError>;
}

struct MemoryInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Insertion order for FIFO capacity eviction. May contain keys already
    /// removed from `entries`; those are skipped when popping.
    order: VecDeque<String>,
}

/// In-process cache tier with FIFO capacity eviction.
///
/// Expired entries are swept probabilistically on `set` with the configured
/// frequency; capacity overruns evict in insertion order until back under
/// the bound.
pub struct MemoryStore<V> {
    inner: Mutex<MemoryInner<V>>,
    max_items: usize,
    evict_frequency: f64,
    time: Arc<dyn TimeProvider>,
}

impl<V: Clone + Send + Sync + 'static> MemoryStore<V> {
    /// Create a memory tier.
    ///
    /// `evict_frequency` is the probability in `[0, 1]` that a `set`
    /// triggers an expired-entry sweep.
    pub fn new(max_items: usize, evict_frequency: f64, time: Arc<dyn TimeProvider>) -> Self {
        debug_assert!((0.0..=1.0).contains(&evict_frequency), "evict_frequency must be in [0, 1]");
        Self {
            inner: Mutex::new(MemoryInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_items,
            evict_frequency,
            time,
        }
    }

    fn full_key(namespace: &str, key: &str) -> String {
        format!("{namespace}:{key}")
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the tier holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn sweep_expired(inner: &mut MemoryInner<V>, now_ms: u64) {
        inner.entries.retain(|_, entry| !entry.is_expired(now_ms));
        inner.order.retain(|key| inner.entries.contains_key(key));
    }

    fn evict_to_capacity(inner: &mut MemoryInner<V>, max_items: usize) {
        while inner.entries.len() > max_items {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> CacheStore<V> for MemoryStore<V> {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry<V>>, CacheError> {
        let now_ms = self.time.now_unix_ms();
        let inner = self.inner.lock();
        match inner.entries.get(&Self::full_key(namespace, key)) {
            Some(entry) if !entry.is_expired(now_ms) => Ok(Some(entry.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, namespace: &str, key: &str, entry: CacheEntry<V>) -> Result<(), CacheError> {
        let full = Self::full_key(namespace, key);
        let sweep = self.evict_frequency > 0.0 && rand::thread_rng().gen::<f64>() < self.evict_frequency;

        let mut inner = self.inner.lock();
        if inner.entries.insert(full.clone(), entry).is_none() {
            inner.order.push_back(full);
        }
        if sweep {
            Self::sweep_expired(&mut inner, self.time.now_unix_ms());
        }
        Self::evict_to_capacity(&mut inner, self.max_items);
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        inner.entries.remove(&Self::full_key(namespace, key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheTtl;
    use crate::time::ManualTimeProvider;

    fn store(max_items: usize) -> (MemoryStore<String>, ManualTimeProvider) {
        let time = ManualTimeProvider::starting_at(0);
        let store = MemoryStore::new(max_items, 0.0, Arc::new(time.clone()));
        (store, time)
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let (store, _) = store(10);
        let entry = CacheEntry::new("v".to_string(), 0, CacheTtl::new(10, 50));
        store.set("ns", "k", entry.clone()).await.unwrap();
        assert_eq!(store.get("ns", "k").await.unwrap(), Some(entry));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let (store, time) = store(10);
        store
            .set("ns", "k", CacheEntry::new("v".to_string(), 0, CacheTtl::new(10, 50)))
            .await
            .unwrap();
        time.set(50);
        assert_eq!(store.get("ns", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn capacity_evicts_in_insertion_order() {
        let (store, _) = store(2);
        for key in ["a", "b", "c"] {
            store
                .set("ns", key, CacheEntry::new(key.to_string(), 0, CacheTtl::new(100, 100)))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("ns", "a").await.unwrap(), None);
        assert!(store.get("ns", "b").await.unwrap().is_some());
        assert!(store.get("ns", "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn overwrite_does_not_duplicate_order() {
        let (store, _) = store(2);
        for _ in 0..5 {
            store
                .set("ns", "a", CacheEntry::new("v".to_string(), 0, CacheTtl::new(100, 100)))
                .await
                .unwrap();
        }
        store
            .set("ns", "b", CacheEntry::new("v".to_string(), 0, CacheTtl::new(100, 100)))
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("ns", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let (store, _) = store(10);
        store
            .set("ns", "k", CacheEntry::new("v".to_string(), 0, CacheTtl::new(100, 100)))
            .await
            .unwrap();
        store.remove("ns", "k").await.unwrap();
        assert_eq!(store.get("ns", "k").await.unwrap(), None);
    }
}
