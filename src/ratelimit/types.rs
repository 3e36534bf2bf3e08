//! Coordinator request/response types, errors, and counters.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::cluster::types::NodeId;
use crate::overrides::resolver::ResolveError;

/// One limit call, post-authentication.
#[derive(Debug, Clone)]
pub struct RatelimitRequest {
    /// Workspace the caller is scoped to.
    pub workspace_id: String,
    /// Namespace name (auto-created when permitted).
    pub namespace: String,
    /// Opaque identifier chosen by the caller.
    pub identifier: String,
    /// Default limit when no override matches.
    pub limit: u64,
    /// Default window duration when no override matches.
    pub duration_ms: u64,
    /// Cost to deduct; 0 peeks without mutating.
    pub cost: u64,
    /// Low-latency path (local decision, async convergence).
    pub async_mode: bool,
}

/// Decision returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatelimitResponse {
    /// Whether the request was admitted.
    pub success: bool,
    /// The effective limit applied.
    pub limit: u64,
    /// Units left before the limit.
    pub remaining: u64,
    /// When the window resets (Unix ms).
    pub reset_at_ms: u64,
    /// Winning override ID, if any.
    pub override_id: Option<String>,
}

/// Errors surfaced by the limit operation.
#[derive(Debug, Error)]
pub enum RatelimitError {
    /// Policy resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Sync mode and the counter's origin node could not be reached.
    #[error("origin node {owner} unavailable: {reason}")]
    OriginUnavailable {
        /// The owner that could not be reached.
        owner: NodeId,
        /// Why the call failed.
        reason: String,
    },

    /// The caller's deadline elapsed before a decision was reached.
    ///
    /// Any local counter increment already committed stays committed; the
    /// cost of abandonment is bounded by this one in-flight request.
    #[error("limit call abandoned after {deadline_ms}ms")]
    DeadlineExceeded {
        /// The deadline that elapsed.
        deadline_ms: u64,
    },

    /// Invariant violation; never expected on the hot path.
    #[error("internal ratelimit error: {reason}")]
    Internal {
        /// What went wrong.
        reason: String,
    },
}

/// Counters the coordinator exposes for observability.
///
/// Plain atomics rather than a metrics pipeline; transport is out of scope
/// but the losses the protocol can incur must still be visible.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Deltas dropped because a per-owner batch overflowed.
    pub deltas_dropped: AtomicU64,
    /// PushCounter calls that failed (origin loss).
    pub origin_push_failures: AtomicU64,
    /// Sync calls served locally because the owner's breaker was open.
    pub breaker_short_circuits: AtomicU64,
    /// Exceeded broadcasts fanned out by this node as owner.
    pub broadcasts_sent: AtomicU64,
    /// Deny pins applied from received broadcasts.
    pub exceeded_pins: AtomicU64,
    /// Batch flush rounds completed.
    pub flushes: AtomicU64,
}

/// Point-in-time copy of [`CoordinatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStatsSnapshot {
    /// Deltas dropped because a per-owner batch overflowed.
    pub deltas_dropped: u64,
    /// PushCounter calls that failed (origin loss).
    pub origin_push_failures: u64,
    /// Sync calls served locally because the owner's breaker was open.
    pub breaker_short_circuits: u64,
    /// Exceeded broadcasts fanned out by this node as owner.
    pub broadcasts_sent: u64,
    /// Deny pins applied from received broadcasts.
    pub exceeded_pins: u64,
    /// Batch flush rounds completed.
    pub flushes: u64,
}

impl CoordinatorStats {
    /// Snapshot the counters.
    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            deltas_dropped: self.deltas_dropped.load(Ordering::Relaxed),
            origin_push_failures: self.origin_push_failures.load(Ordering::Relaxed),
            breaker_short_circuits: self.breaker_short_circuits.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
            exceeded_pins: self.exceeded_pins.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}
