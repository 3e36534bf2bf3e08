//! Tiered cache chain with stale-while-revalidate reads.
//!
//! A cache is an ordered list of stores; probes run front to back, hits
//! backfill the earlier tiers, writes go to every tier. Tier errors are
//! fail-soft: the chain logs them and keeps going, and only an all-tier
//! failure surfaces to the caller. Origin loads are deduplicated per key via
//! [`SingleFlight`].

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;
use tracing::warn;

use crate::cache::entry::CacheEntry;
use crate::cache::entry::CacheTtl;
use crate::cache::error::CacheError;
use crate::cache::single_flight::SingleFlight;
use crate::cache::store::CacheStore;
use crate::time::TimeProvider;

/// Ordered chain of cache tiers for values of type `V`.
///
/// `E` is the origin loader's error type; it must be `Clone` so one failed
/// load can be shared with every deduplicated waiter.
pub struct TieredCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    label: &'static str,
    stores: Vec<Arc<dyn CacheStore<V>>>,
    flight: Arc<SingleFlight<Result<V, E>>>,
    ttl: CacheTtl,
    time: Arc<dyn TimeProvider>,
}

impl<V, E> Clone for TieredCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            stores: self.stores.clone(),
            flight: self.flight.clone(),
            ttl: self.ttl,
            time: self.time.clone(),
        }
    }
}

impl<V, E> TieredCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Build a chain from ordered tiers; the first tier is probed first.
    pub fn new(
        label: &'static str,
        stores: Vec<Arc<dyn CacheStore<V>>>,
        ttl: CacheTtl,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        debug_assert!(!stores.is_empty(), "cache chain needs at least one tier");
        Self {
            label,
            stores,
            flight: Arc::new(SingleFlight::new()),
            ttl,
            time,
        }
    }

    /// Probe the chain for a value, regardless of freshness.
    pub async fn get(&self, namespace: &'static str, key: &str) -> Result<Option<V>, CacheError> {
        Ok(self.get_entry(namespace, key).await?.map(|entry| entry.value))
    }

    /// Probe the chain for a full entry, backfilling earlier tiers on a hit.
    pub async fn get_entry(&self, namespace: &'static str, key: &str) -> Result<Option<CacheEntry<V>>, CacheError> {
        let mut failures = 0usize;
        for (index, store) in self.stores.iter().enumerate() {
            match store.get(namespace, key).await {
                Ok(Some(entry)) => {
                    if index > 0 {
                        self.backfill(namespace, key, index, entry.clone());
                    }
                    return Ok(Some(entry));
                }
                Ok(None) => {}
                Err(err) => {
                    failures += 1;
                    warn!(cache = self.label, tier = store.name(), key, error = %err, "cache tier get failed");
                }
            }
        }
        if failures == self.stores.len() {
            return Err(CacheError::AllTiersFailed { key: key.to_string() });
        }
        Ok(None)
    }

    /// Write a value to every tier in parallel under the chain's TTL.
    pub async fn set(&self, namespace: &'static str, key: &str, value: V) -> Result<(), CacheError> {
        self.set_with_ttl(namespace, key, value, self.ttl).await
    }

    /// Write a value to every tier in parallel under an explicit TTL.
    pub async fn set_with_ttl(
        &self,
        namespace: &'static str,
        key: &str,
        value: V,
        ttl: CacheTtl,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry::new(value, self.time.now_unix_ms(), ttl);
        let writes = self.stores.iter().map(|store| {
            let entry = entry.clone();
            async move { (store.name(), store.set(namespace, key, entry).await) }
        });

        let mut failures = 0usize;
        for (tier, result) in join_all(writes).await {
            if let Err(err) = result {
                failures += 1;
                warn!(cache = self.label, tier, key, error = %err, "cache tier set failed");
            }
        }
        if failures == self.stores.len() {
            return Err(CacheError::AllTiersFailed { key: key.to_string() });
        }
        Ok(())
    }

    /// Remove a key from every tier.
    pub async fn remove(&self, namespace: &'static str, key: &str) -> Result<(), CacheError> {
        let removes = self
            .stores
            .iter()
            .map(|store| async move { (store.name(), store.remove(namespace, key).await) });

        let mut failures = 0usize;
        for (tier, result) in join_all(removes).await {
            if let Err(err) = result {
                failures += 1;
                warn!(cache = self.label, tier, key, error = %err, "cache tier remove failed");
            }
        }
        if failures == self.stores.len() {
            return Err(CacheError::AllTiersFailed { key: key.to_string() });
        }
        Ok(())
    }

    /// Stale-while-revalidate read.
    ///
    /// Fresh hits return immediately. Stale-but-alive hits return the cached
    /// value and refresh in the background. Misses load synchronously. All
    /// loads for one key are shared across concurrent callers; the loader's
    /// error is returned to the caller as-is.
    pub async fn swr<F, Fut>(&self, namespace: &'static str, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let now_ms = self.time.now_unix_ms();
        let cached = match self.get_entry(namespace, key).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(cache = self.label, key, error = %err, "cache chain unavailable, loading from origin");
                None
            }
        };

        if let Some(entry) = cached {
            if entry.is_fresh(now_ms) {
                return Ok(entry.value);
            }
            // Stale but alive: serve it and revalidate off the hot path.
            debug!(cache = self.label, key, "serving stale, revalidating in background");
            self.spawn_revalidate(namespace, key.to_string(), load);
            return Ok(entry.value);
        }

        self.load_shared(namespace, key.to_string(), load).await
    }

    /// Asynchronously copy an entry found in a deeper tier into the tiers
    /// before it.
    fn backfill(&self, namespace: &'static str, key: &str, found_at: usize, entry: CacheEntry<V>) {
        let stores = self.stores[..found_at].to_vec();
        let key = key.to_string();
        let label = self.label;
        tokio::spawn(async move {
            for store in stores {
                if let Err(err) = store.set(namespace, &key, entry.clone()).await {
                    warn!(cache = label, tier = store.name(), key = %key, error = %err, "cache backfill failed");
                }
            }
        });
    }

    fn spawn_revalidate<F, Fut>(&self, namespace: &'static str, key: String, load: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            let _ = cache.load_shared(namespace, key, load).await;
        });
    }

    /// Run the loader deduplicated per key; the leader writes the result back.
    async fn load_shared<F, Fut>(&self, namespace: &'static str, key: String, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let flight_key = format!("{namespace}:{key}");
        let cache = self.clone();
        self.flight
            .run(&flight_key, move || async move {
                let result = load().await;
                if let Ok(value) = &result {
                    if let Err(err) = cache.set(namespace, &key, value.clone()).await {
                        warn!(cache = cache.label, key = %key, error = %err, "failed to store loaded value");
                    }
                }
                result
            })
            .await
    }
}
