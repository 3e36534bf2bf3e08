//! Cache entry and TTL types.

use serde::Deserialize;
use serde::Serialize;

/// Freshness policy applied when an entry is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
    /// How long the entry is served without revalidation.
    pub fresh_ms: u64,
    /// How long past freshness the entry may be served stale.
    pub stale_ms: u64,
}

impl CacheTtl {
    /// Construct a TTL; the stale horizon is clamped to at least `fresh_ms`.
    pub fn new(fresh_ms: u64, stale_ms: u64) -> Self {
        Self {
            fresh_ms,
            stale_ms: stale_ms.max(fresh_ms),
        }
    }
}

/// A cached value with its freshness bounds.
///
/// Invariant: `fresh_until_ms <= stale_until_ms`. An entry past
/// `stale_until_ms` is treated as absent everywhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,
    /// Until when the entry is fresh (Unix ms).
    pub fresh_until_ms: u64,
    /// Until when the entry may be served stale (Unix ms).
    pub stale_until_ms: u64,
}

impl<V> CacheEntry<V> {
    /// Build an entry valid from `now_ms` under `ttl`.
    pub fn new(value: V, now_ms: u64, ttl: CacheTtl) -> Self {
        let fresh_until_ms = now_ms.saturating_add(ttl.fresh_ms);
        let stale_until_ms = now_ms.saturating_add(ttl.stale_ms).max(fresh_until_ms);
        Self {
            value,
            fresh_until_ms,
            stale_until_ms,
        }
    }

    /// Entry is within its freshness window.
    #[inline]
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms < self.fresh_until_ms
    }

    /// Entry is past its stale horizon and must be treated as absent.
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.stale_until_ms
    }
}
