//! Override resolution: (workspace, namespace, identifier) → effective policy.
//!
//! Namespace records and override sets are read through the tiered cache
//! with stale-while-revalidate, so a policy edit is visible within the stale
//! horizon (≤ 60 s) without putting the primary store on the hot path.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::cache::CacheStore;
use crate::cache::CacheTtl;
use crate::cache::MemoryStore;
use crate::cache::TieredCache;
use crate::config::CacheConfig;
use crate::constants::CACHE_FRESH_MS;
use crate::constants::CACHE_STALE_MS;
use crate::overrides::store::CreateOutcome;
use crate::overrides::store::PrimaryStore;
use crate::overrides::store::StoreError;
use crate::overrides::types::EffectivePolicy;
use crate::overrides::types::LimitDefaults;
use crate::overrides::types::Namespace;
use crate::overrides::types::RatelimitOverride;
use crate::overrides::wildcard;
use crate::time::TimeProvider;

/// Cache namespace for namespace records.
pub const NAMESPACE_CACHE: &str = "namespace";
/// Cache namespace for per-namespace override sets.
pub const OVERRIDE_SET_CACHE: &str = "override_set";

/// Errors surfaced by policy resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The namespace does not exist and the caller may not auto-create it.
    #[error("ratelimit namespace not found: {name}")]
    NamespaceNotFound {
        /// The requested namespace name.
        name: String,
    },

    /// The primary store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A resolved policy together with the namespace it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    /// The (possibly auto-created) namespace.
    pub namespace: Namespace,
    /// Effective limit parameters for this call.
    pub policy: EffectivePolicy,
}

/// Resolves effective limit parameters for each limit call.
pub struct OverrideResolver {
    store: Arc<dyn PrimaryStore>,
    namespaces: TieredCache<Namespace, StoreError>,
    override_sets: TieredCache<Vec<RatelimitOverride>, StoreError>,
    time: Arc<dyn TimeProvider>,
}

impl OverrideResolver {
    /// Build a resolver over explicit cache chains.
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        namespaces: TieredCache<Namespace, StoreError>,
        override_sets: TieredCache<Vec<RatelimitOverride>, StoreError>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            namespaces,
            override_sets,
            time,
        }
    }

    /// Build a resolver with single-tier in-process caches.
    pub fn with_memory_cache(store: Arc<dyn PrimaryStore>, config: &CacheConfig, time: Arc<dyn TimeProvider>) -> Self {
        let ttl = CacheTtl::new(CACHE_FRESH_MS, CACHE_STALE_MS);
        let ns_tier: Arc<dyn CacheStore<Namespace>> =
            Arc::new(MemoryStore::new(config.max_items, config.evict_frequency, time.clone()));
        let ov_tier: Arc<dyn CacheStore<Vec<RatelimitOverride>>> =
            Arc::new(MemoryStore::new(config.max_items, config.evict_frequency, time.clone()));
        Self::new(
            store,
            TieredCache::new(NAMESPACE_CACHE, vec![ns_tier], ttl, time.clone()),
            TieredCache::new(OVERRIDE_SET_CACHE, vec![ov_tier], ttl, time.clone()),
            time,
        )
    }

    /// Resolve the policy for one limit call.
    pub async fn resolve(
        &self,
        workspace_id: &str,
        namespace_name: &str,
        identifier: &str,
        defaults: LimitDefaults,
        can_create_namespace: bool,
    ) -> Result<ResolvedPolicy, ResolveError> {
        let namespace = self.ensure_namespace(workspace_id, namespace_name, can_create_namespace).await?;
        let overrides = self.load_overrides(&namespace.id).await?;

        let policy = match wildcard::select(overrides.iter().filter(|ov| !ov.is_deleted()), identifier) {
            Some(winner) => {
                debug!(namespace = namespace_name, identifier, override_id = %winner.id, "override matched");
                EffectivePolicy::from_override(winner)
            }
            None => EffectivePolicy::from_defaults(defaults),
        };
        Ok(ResolvedPolicy { namespace, policy })
    }

    /// Fetch a namespace, auto-creating it when permitted.
    ///
    /// Creation uses a duplicate-key-safe insert: a concurrent creator wins
    /// the race and this call adopts its row.
    pub async fn ensure_namespace(
        &self,
        workspace_id: &str,
        name: &str,
        can_create: bool,
    ) -> Result<Namespace, ResolveError> {
        let cache_key = namespace_cache_key(workspace_id, name);
        let store = self.store.clone();
        let ws = workspace_id.to_string();
        let n = name.to_string();

        let loaded = self
            .namespaces
            .swr(NAMESPACE_CACHE, &cache_key, move || async move {
                match store.find_namespace(&ws, &n).await? {
                    Some(ns) => Ok(ns),
                    None => Err(StoreError::NotFound {
                        entity: "namespace",
                        key: format!("{ws}/{n}"),
                    }),
                }
            })
            .await;

        match loaded {
            Ok(ns) => Ok(ns),
            Err(StoreError::NotFound { .. }) if can_create => self.create_namespace(workspace_id, name, &cache_key).await,
            Err(StoreError::NotFound { .. }) => Err(ResolveError::NamespaceNotFound { name: name.to_string() }),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_namespace(&self, workspace_id: &str, name: &str, cache_key: &str) -> Result<Namespace, ResolveError> {
        let candidate = Namespace::new(workspace_id, name, self.time.now_unix_ms());
        let namespace = match self.store.create_namespace(candidate.clone()).await? {
            CreateOutcome::Created => {
                debug!(workspace_id, namespace = name, id = %candidate.id, "auto-created namespace");
                candidate
            }
            // Lost the creation race: adopt the winner's row.
            CreateOutcome::AlreadyExists => self
                .store
                .find_namespace(workspace_id, name)
                .await?
                .ok_or_else(|| ResolveError::NamespaceNotFound { name: name.to_string() })?,
        };
        let _ = self.namespaces.set(NAMESPACE_CACHE, cache_key, namespace.clone()).await;
        Ok(namespace)
    }

    async fn load_overrides(&self, namespace_id: &str) -> Result<Vec<RatelimitOverride>, ResolveError> {
        let store = self.store.clone();
        let ns_id = namespace_id.to_string();
        self.override_sets
            .swr(OVERRIDE_SET_CACHE, namespace_id, move || async move {
                store.list_overrides(&ns_id).await
            })
            .await
            .map_err(ResolveError::from)
    }

    /// Drop cached state for a namespace after an administrative change.
    pub async fn invalidate(&self, workspace_id: &str, namespace_name: &str, namespace_id: &str) {
        let _ = self
            .namespaces
            .remove(NAMESPACE_CACHE, &namespace_cache_key(workspace_id, namespace_name))
            .await;
        let _ = self.override_sets.remove(OVERRIDE_SET_CACHE, namespace_id).await;
    }

    /// Drop only the cached override set for a namespace.
    pub async fn invalidate_overrides(&self, namespace_id: &str) {
        let _ = self.override_sets.remove(OVERRIDE_SET_CACHE, namespace_id).await;
    }
}

fn namespace_cache_key(workspace_id: &str, name: &str) -> String {
    format!("{workspace_id}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::store::MemoryPrimaryStore;
    use crate::overrides::store::NamespaceStore;
    use crate::overrides::store::OverrideStore;
    use crate::overrides::types::Sharding;
    use crate::time::SystemTimeProvider;

    fn resolver_with(store: Arc<MemoryPrimaryStore>) -> OverrideResolver {
        OverrideResolver::with_memory_cache(store, &CacheConfig::default(), Arc::new(SystemTimeProvider))
    }

    fn defaults() -> LimitDefaults {
        LimitDefaults {
            limit: 10,
            duration_ms: 60_000,
            async_mode: false,
        }
    }

    #[tokio::test]
    async fn missing_namespace_without_permission_errors() {
        let store = Arc::new(MemoryPrimaryStore::new());
        let resolver = resolver_with(store);
        let err = resolver.resolve("ws", "email.send", "id", defaults(), false).await.unwrap_err();
        assert!(matches!(err, ResolveError::NamespaceNotFound { .. }));
    }

    #[tokio::test]
    async fn auto_creates_namespace_with_permission() {
        let store = Arc::new(MemoryPrimaryStore::new());
        let resolver = resolver_with(store.clone());

        let resolved = resolver.resolve("ws", "email.send", "id", defaults(), true).await.unwrap();
        assert_eq!(resolved.policy.limit, 10);
        assert!(resolved.policy.override_id.is_none());
        assert_eq!(resolved.namespace.name, "email.send");

        let ns = store.find_namespace("ws", "email.send").await.unwrap();
        assert!(ns.is_some());
    }

    #[tokio::test]
    async fn concurrent_auto_create_yields_one_row() {
        let store = Arc::new(MemoryPrimaryStore::new());
        let resolver = Arc::new(resolver_with(store.clone()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                resolver.resolve("ws", "fresh", &format!("id{i}"), defaults(), true).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Exactly one live row despite the race.
        let ns = store.find_namespace("ws", "fresh").await.unwrap().unwrap();
        let again = store.find_namespace("ws", "fresh").await.unwrap().unwrap();
        assert_eq!(ns.id, again.id);
    }

    #[tokio::test]
    async fn override_wins_over_defaults() {
        let store = Arc::new(MemoryPrimaryStore::new());
        let ns = Namespace::new("ws", "api.calls", 0);
        store.create_namespace(ns.clone()).await.unwrap();
        store
            .upsert_override(RatelimitOverride {
                id: "ov_1".to_string(),
                namespace_id: ns.id.clone(),
                identifier: "*@acme.com".to_string(),
                limit: 100,
                duration_ms: 1_000,
                async_mode: true,
                sharding: Some(Sharding::Edge),
                created_at_ms: 0,
                deleted_at_ms: None,
            })
            .await
            .unwrap();

        let resolver = resolver_with(store);
        let resolved = resolver.resolve("ws", "api.calls", "eng@acme.com", defaults(), false).await.unwrap();
        assert_eq!(resolved.policy.limit, 100);
        assert_eq!(resolved.policy.duration_ms, 1_000);
        assert!(resolved.policy.async_mode);
        assert_eq!(resolved.policy.sharding, Some(Sharding::Edge));
        assert_eq!(resolved.policy.override_id.as_deref(), Some("ov_1"));

        let fallback = resolver.resolve("ws", "api.calls", "eng@other.com", defaults(), false).await.unwrap();
        assert_eq!(fallback.policy.limit, 10);
        assert!(fallback.policy.override_id.is_none());
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let store = Arc::new(MemoryPrimaryStore::new());
        let ns = Namespace::new("ws", "api.calls", 0);
        store.create_namespace(ns.clone()).await.unwrap();
        for (i, pattern) in ["ceo@*", "*@acme.com", "ceo@acme.*"].iter().enumerate() {
            store
                .upsert_override(RatelimitOverride {
                    id: format!("ov_{i}"),
                    namespace_id: ns.id.clone(),
                    identifier: pattern.to_string(),
                    limit: (i as u64 + 1) * 10,
                    duration_ms: 1_000,
                    async_mode: false,
                    sharding: None,
                    created_at_ms: 0,
                    deleted_at_ms: None,
                })
                .await
                .unwrap();
        }

        let resolver = resolver_with(store);
        let first = resolver.resolve("ws", "api.calls", "ceo@acme.com", defaults(), false).await.unwrap();
        for _ in 0..5 {
            let again = resolver.resolve("ws", "api.calls", "ceo@acme.com", defaults(), false).await.unwrap();
            assert_eq!(first.policy.override_id, again.policy.override_id);
        }
    }

    #[tokio::test]
    async fn store_outage_surfaces_store_error() {
        let store = Arc::new(MemoryPrimaryStore::new());
        store.set_unavailable(true);
        let resolver = resolver_with(store);
        let err = resolver.resolve("ws", "x", "id", defaults(), true).await.unwrap_err();
        assert!(matches!(err, ResolveError::Store(StoreError::Unavailable { .. })));
    }
}
