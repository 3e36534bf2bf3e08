//! Primary-store capability traits and the in-memory implementation.
//!
//! Namespaces and overrides persist in a relational store owned by the
//! platform; this module defines the contract the limiter needs from it.
//! [`MemoryPrimaryStore`] is the deterministic in-memory backend used by
//! tests and single-node deployments.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::constants::MAX_OVERRIDES_PER_NAMESPACE;
use crate::overrides::types::Namespace;
use crate::overrides::types::RatelimitOverride;

/// Errors raised by the primary store.
///
/// `Clone` so a failed load can be shared across deduplicated cache waiters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested row does not exist (or is soft-deleted).
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Entity kind, e.g. "namespace".
        entity: &'static str,
        /// Lookup key that missed.
        key: String,
    },

    /// A uniqueness constraint rejected the write.
    #[error("duplicate {entity}: {key}")]
    Duplicate {
        /// Entity kind.
        entity: &'static str,
        /// Conflicting key.
        key: String,
    },

    /// The store could not be reached.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Why the store was unreachable.
        reason: String,
    },

    /// A stored row violated an invariant.
    #[error("corrupted row for {key}: {reason}")]
    Corrupted {
        /// Affected key.
        key: String,
        /// What was wrong.
        reason: String,
    },
}

/// Outcome of a duplicate-key-safe insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The row was inserted.
    Created,
    /// A live row with the same unique key already existed.
    AlreadyExists,
}

/// Namespace persistence contract.
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Find a live namespace by `(workspace_id, name)`.
    async fn find_namespace(&self, workspace_id: &str, name: &str) -> Result<Option<Namespace>, StoreError>;

    /// Fetch a live namespace by ID.
    async fn get_namespace(&self, namespace_id: &str) -> Result<Option<Namespace>, StoreError>;

    /// Insert a namespace; safe to race, the loser observes `AlreadyExists`.
    async fn create_namespace(&self, namespace: Namespace) -> Result<CreateOutcome, StoreError>;

    /// Soft-delete a namespace. Returns whether a live row was deleted.
    async fn delete_namespace(&self, namespace_id: &str, now_ms: u64) -> Result<bool, StoreError>;
}

/// Override persistence contract.
#[async_trait]
pub trait OverrideStore: Send + Sync {
    /// All live overrides for a namespace, bounded by
    /// [`MAX_OVERRIDES_PER_NAMESPACE`].
    async fn list_overrides(&self, namespace_id: &str) -> Result<Vec<RatelimitOverride>, StoreError>;

    /// Find a live override by its exact stored identifier pattern.
    async fn find_override(&self, namespace_id: &str, identifier: &str) -> Result<Option<RatelimitOverride>, StoreError>;

    /// Insert or replace the override for `(namespace_id, identifier)`.
    ///
    /// Replacing keeps the existing row ID.
    async fn upsert_override(&self, ov: RatelimitOverride) -> Result<RatelimitOverride, StoreError>;

    /// Soft-delete an override. Returns whether a live row was deleted.
    async fn delete_override(&self, namespace_id: &str, identifier: &str, now_ms: u64) -> Result<bool, StoreError>;

    /// Cursor-paginated listing ordered by identifier.
    ///
    /// `cursor` is the last identifier of the previous page; the returned
    /// cursor is `None` on the final page.
    async fn page_overrides(
        &self,
        namespace_id: &str,
        cursor: Option<String>,
        page_size: usize,
    ) -> Result<(Vec<RatelimitOverride>, Option<String>), StoreError>;
}

/// Both persistence contracts behind one object.
pub trait PrimaryStore: NamespaceStore + OverrideStore {}

impl<T: NamespaceStore + OverrideStore> PrimaryStore for T {}

#[derive(Default)]
struct MemoryPrimaryInner {
    /// Keyed by namespace ID.
    namespaces: HashMap<String, Namespace>,
    /// Keyed by override ID.
    overrides: HashMap<String, RatelimitOverride>,
}

/// Deterministic in-memory primary store.
///
/// Mirrors the relational schema's uniqueness rules: `(workspace_id, name)`
/// for namespaces and `(namespace_id, identifier)` for overrides, both
/// scoped to live rows. `fail_next` simulates an unreachable store in tests.
#[derive(Default)]
pub struct MemoryPrimaryStore {
    inner: RwLock<MemoryPrimaryInner>,
    unavailable: AtomicBool,
}

impl MemoryPrimaryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated unavailability; every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "simulated outage".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NamespaceStore for MemoryPrimaryStore {
    async fn find_namespace(&self, workspace_id: &str, name: &str) -> Result<Option<Namespace>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner
            .namespaces
            .values()
            .find(|ns| ns.workspace_id == workspace_id && ns.name == name && !ns.is_deleted())
            .cloned())
    }

    async fn get_namespace(&self, namespace_id: &str) -> Result<Option<Namespace>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner.namespaces.get(namespace_id).filter(|ns| !ns.is_deleted()).cloned())
    }

    async fn create_namespace(&self, namespace: Namespace) -> Result<CreateOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let exists = inner
            .namespaces
            .values()
            .any(|ns| ns.workspace_id == namespace.workspace_id && ns.name == namespace.name && !ns.is_deleted());
        if exists {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.namespaces.insert(namespace.id.clone(), namespace);
        Ok(CreateOutcome::Created)
    }

    async fn delete_namespace(&self, namespace_id: &str, now_ms: u64) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        match inner.namespaces.get_mut(namespace_id) {
            Some(ns) if !ns.is_deleted() => {
                ns.deleted_at_ms = Some(now_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl OverrideStore for MemoryPrimaryStore {
    async fn list_overrides(&self, namespace_id: &str) -> Result<Vec<RatelimitOverride>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut rows: Vec<RatelimitOverride> = inner
            .overrides
            .values()
            .filter(|ov| ov.namespace_id == namespace_id && !ov.is_deleted())
            .take(MAX_OVERRIDES_PER_NAMESPACE)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(rows)
    }

    async fn find_override(&self, namespace_id: &str, identifier: &str) -> Result<Option<RatelimitOverride>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner
            .overrides
            .values()
            .find(|ov| ov.namespace_id == namespace_id && ov.identifier == identifier && !ov.is_deleted())
            .cloned())
    }

    async fn upsert_override(&self, mut ov: RatelimitOverride) -> Result<RatelimitOverride, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let existing_id = inner
            .overrides
            .values()
            .find(|row| row.namespace_id == ov.namespace_id && row.identifier == ov.identifier && !row.is_deleted())
            .map(|row| row.id.clone());
        if let Some(id) = existing_id {
            ov.id = id.clone();
        }
        inner.overrides.insert(ov.id.clone(), ov.clone());
        Ok(ov)
    }

    async fn delete_override(&self, namespace_id: &str, identifier: &str, now_ms: u64) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let row = inner
            .overrides
            .values_mut()
            .find(|ov| ov.namespace_id == namespace_id && ov.identifier == identifier && !ov.is_deleted());
        match row {
            Some(ov) => {
                ov.deleted_at_ms = Some(now_ms);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn page_overrides(
        &self,
        namespace_id: &str,
        cursor: Option<String>,
        page_size: usize,
    ) -> Result<(Vec<RatelimitOverride>, Option<String>), StoreError> {
        self.check_available()?;
        let all = self.list_overrides(namespace_id).await?;
        let start = match &cursor {
            Some(cursor) => all.partition_point(|ov| ov.identifier.as_str() <= cursor.as_str()),
            None => 0,
        };
        let page: Vec<RatelimitOverride> = all.into_iter().skip(start).take(page_size).collect();
        let next = if page.len() == page_size {
            page.last().map(|ov| ov.identifier.clone())
        } else {
            None
        };
        Ok((page, next))
    }
}
