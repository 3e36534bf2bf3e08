//! Administrative override CRUD.
//!
//! Backs the `setOverride` / `getOverride` / `listOverrides` /
//! `deleteOverride` operations. Every mutation invalidates the resolver's
//! cached override set so the change takes effect on the next revalidation.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::overrides::resolver::OverrideResolver;
use crate::overrides::resolver::ResolveError;
use crate::overrides::store::PrimaryStore;
use crate::overrides::store::StoreError;
use crate::overrides::types::Namespace;
use crate::overrides::types::RatelimitOverride;
use crate::overrides::types::Sharding;
use crate::time::TimeProvider;

/// How a caller addresses a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceSelector {
    /// By human-chosen name, scoped to the caller's workspace.
    Name(String),
    /// By opaque namespace ID.
    Id(String),
}

/// Errors surfaced by override administration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdminError {
    /// The addressed namespace does not exist in this workspace.
    #[error("ratelimit namespace not found: {selector}")]
    NamespaceNotFound {
        /// The name or ID the caller used.
        selector: String,
    },

    /// No live override exists for the identifier.
    #[error("override not found for identifier {identifier}")]
    OverrideNotFound {
        /// The requested identifier pattern.
        identifier: String,
    },

    /// The primary store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ResolveError> for AdminError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NamespaceNotFound { name } => Self::NamespaceNotFound { selector: name },
            ResolveError::Store(err) => Self::Store(err),
        }
    }
}

/// Parameters for creating or replacing an override.
#[derive(Debug, Clone)]
pub struct OverrideParams {
    /// Replacement limit.
    pub limit: u64,
    /// Replacement window duration in milliseconds.
    pub duration_ms: u64,
    /// Replacement async-mode flag.
    pub async_mode: bool,
    /// Optional sharding directive.
    pub sharding: Option<Sharding>,
}

/// Override CRUD over the primary store.
pub struct OverrideAdmin {
    store: Arc<dyn PrimaryStore>,
    resolver: Arc<OverrideResolver>,
    time: Arc<dyn TimeProvider>,
}

impl OverrideAdmin {
    /// Build the admin surface.
    pub fn new(store: Arc<dyn PrimaryStore>, resolver: Arc<OverrideResolver>, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            store,
            resolver,
            time,
        }
    }

    /// Resolve a selector to a live namespace in the caller's workspace.
    ///
    /// Name selectors may auto-create when the caller holds the
    /// `create_namespace` permission; ID selectors never create.
    pub async fn resolve_namespace(
        &self,
        workspace_id: &str,
        selector: &NamespaceSelector,
        can_create: bool,
    ) -> Result<Namespace, AdminError> {
        match selector {
            NamespaceSelector::Name(name) => {
                Ok(self.resolver.ensure_namespace(workspace_id, name, can_create).await?)
            }
            NamespaceSelector::Id(id) => {
                let ns = self.store.get_namespace(id).await?.filter(|ns| ns.workspace_id == workspace_id);
                ns.ok_or_else(|| AdminError::NamespaceNotFound {
                    selector: id.clone(),
                })
            }
        }
    }

    /// Create or replace the override for `(namespace, identifier)`.
    pub async fn set_override(
        &self,
        workspace_id: &str,
        selector: &NamespaceSelector,
        identifier: &str,
        params: OverrideParams,
        can_create_namespace: bool,
    ) -> Result<RatelimitOverride, AdminError> {
        let namespace = self.resolve_namespace(workspace_id, selector, can_create_namespace).await?;
        let row = RatelimitOverride {
            id: format!("rlor_{}", uuid::Uuid::new_v4().simple()),
            namespace_id: namespace.id.clone(),
            identifier: identifier.to_string(),
            limit: params.limit,
            duration_ms: params.duration_ms,
            async_mode: params.async_mode,
            sharding: params.sharding,
            created_at_ms: self.time.now_unix_ms(),
            deleted_at_ms: None,
        };
        let stored = self.store.upsert_override(row).await?;
        self.resolver.invalidate_overrides(&namespace.id).await;
        info!(
            workspace_id,
            namespace = %namespace.name,
            identifier,
            override_id = %stored.id,
            limit = stored.limit,
            "override set"
        );
        Ok(stored)
    }

    /// Fetch the override for `(namespace, identifier)`.
    pub async fn get_override(
        &self,
        workspace_id: &str,
        selector: &NamespaceSelector,
        identifier: &str,
    ) -> Result<RatelimitOverride, AdminError> {
        let namespace = self.resolve_namespace(workspace_id, selector, false).await?;
        self.store
            .find_override(&namespace.id, identifier)
            .await?
            .ok_or_else(|| AdminError::OverrideNotFound {
                identifier: identifier.to_string(),
            })
    }

    /// Cursor-paginated override listing.
    pub async fn list_overrides(
        &self,
        workspace_id: &str,
        selector: &NamespaceSelector,
        cursor: Option<String>,
        page_size: usize,
    ) -> Result<(Vec<RatelimitOverride>, Option<String>), AdminError> {
        let namespace = self.resolve_namespace(workspace_id, selector, false).await?;
        Ok(self.store.page_overrides(&namespace.id, cursor, page_size).await?)
    }

    /// Soft-delete the override for `(namespace, identifier)`.
    pub async fn delete_override(
        &self,
        workspace_id: &str,
        selector: &NamespaceSelector,
        identifier: &str,
    ) -> Result<(), AdminError> {
        let namespace = self.resolve_namespace(workspace_id, selector, false).await?;
        let deleted = self.store.delete_override(&namespace.id, identifier, self.time.now_unix_ms()).await?;
        if !deleted {
            return Err(AdminError::OverrideNotFound {
                identifier: identifier.to_string(),
            });
        }
        self.resolver.invalidate_overrides(&namespace.id).await;
        info!(workspace_id, namespace = %namespace.name, identifier, "override deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::overrides::store::MemoryPrimaryStore;
    use crate::overrides::store::NamespaceStore;
    use crate::time::SystemTimeProvider;

    fn admin() -> (OverrideAdmin, Arc<MemoryPrimaryStore>) {
        let store = Arc::new(MemoryPrimaryStore::new());
        let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let resolver = Arc::new(OverrideResolver::with_memory_cache(
            store.clone(),
            &CacheConfig::default(),
            time.clone(),
        ));
        (OverrideAdmin::new(store.clone(), resolver, time), store)
    }

    fn params(limit: u64) -> OverrideParams {
        OverrideParams {
            limit,
            duration_ms: 60_000,
            async_mode: false,
            sharding: None,
        }
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let (admin, _) = admin();
        let selector = NamespaceSelector::Name("api.calls".to_string());

        let stored = admin.set_override("ws", &selector, "user_*", params(50), true).await.unwrap();
        let fetched = admin.get_override("ws", &selector, "user_*").await.unwrap();
        assert_eq!(stored, fetched);
        assert_eq!(fetched.limit, 50);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let (admin, _) = admin();
        let selector = NamespaceSelector::Name("api.calls".to_string());

        admin.set_override("ws", &selector, "x", params(5), true).await.unwrap();
        admin.delete_override("ws", &selector, "x").await.unwrap();
        let err = admin.get_override("ws", &selector, "x").await.unwrap_err();
        assert!(matches!(err, AdminError::OverrideNotFound { .. }));
    }

    #[tokio::test]
    async fn id_selector_never_creates_and_checks_workspace() {
        let (admin, store) = admin();
        let err = admin
            .set_override("ws", &NamespaceSelector::Id("ns_missing".to_string()), "x", params(5), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::NamespaceNotFound { .. }));

        let ns = Namespace::new("other-ws", "theirs", 0);
        store.create_namespace(ns.clone()).await.unwrap();
        let err = admin
            .get_override("ws", &NamespaceSelector::Id(ns.id.clone()), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::NamespaceNotFound { .. }));
    }

    #[tokio::test]
    async fn list_paginates() {
        let (admin, _) = admin();
        let selector = NamespaceSelector::Name("api.calls".to_string());
        for id in ["a", "b", "c"] {
            admin.set_override("ws", &selector, id, params(1), true).await.unwrap();
        }
        let (page, cursor) = admin.list_overrides("ws", &selector, None, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        let (rest, done) = admin.list_overrides("ws", &selector, cursor, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(done.is_none());
    }
}
