//! Cache error type.

use thiserror::Error;

/// Errors surfaced by cache tiers.
///
/// Tier failures are fail-soft: the chain logs them and advances to the next
/// tier. Only when every tier fails does a caller of `get` see
/// [`CacheError::AllTiersFailed`]. `Clone` so a single in-flight result can
/// be shared across waiters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A single tier failed to serve the operation.
    #[error("cache tier {tier} failed: {reason}")]
    Tier {
        /// Tier name (e.g. "memory").
        tier: &'static str,
        /// Why the tier failed.
        reason: String,
    },

    /// Every tier in the chain failed for this key.
    #[error("all cache tiers failed for key {key}")]
    AllTiersFailed {
        /// The affected cache key.
        key: String,
    },
}
