//! Shared per-process counter table.
//!
//! Counters are keyed by the full limit tuple so changing parameters for an
//! identifier starts a fresh sequence. The table is sharded via `DashMap`;
//! the entry guard is the per-counter lock, so concurrent callers within one
//! process never lose increments. State is ephemeral by design: nothing here
//! survives a restart.

use dashmap::DashMap;

use crate::constants::COUNTER_IDLE_FACTOR;
use crate::counter::window::SlidingWindow;
use crate::counter::window::WindowDecision;

/// Stable key for one counter sequence.
pub fn sequence_key(namespace_id: &str, identifier: &str, limit: u64, duration_ms: u64) -> String {
    format!("rl:{namespace_id}:{limit}:{duration_ms}:{identifier}")
}

/// Outcome of folding a remote delta into the authoritative counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Authoritative count in the current window after the delta.
    pub current: u64,
    /// Whether the authoritative count is still within the limit.
    pub passed: bool,
    /// When the current window closes (Unix ms).
    pub reset_at_ms: u64,
    /// True the first time the count moves past the limit in this window.
    pub crossed: bool,
}

#[derive(Debug)]
struct CounterSlot {
    window: SlidingWindow,
    duration_ms: u64,
    /// Deny-pin from an exceeded broadcast; 0 when unpinned.
    deny_until_ms: u64,
    /// Set once this window's exceeded broadcast has been triggered.
    exceeded_window_start_ms: u64,
    last_access_ms: u64,
}

impl CounterSlot {
    fn new(now_ms: u64, duration_ms: u64) -> Self {
        Self {
            window: SlidingWindow::new(now_ms, duration_ms),
            duration_ms,
            deny_until_ms: 0,
            exceeded_window_start_ms: 0,
            last_access_ms: now_ms,
        }
    }
}

/// Process-wide counter table.
#[derive(Debug, Default)]
pub struct CounterMap {
    slots: DashMap<String, CounterSlot>,
}

impl CounterMap {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `cost` to the counter, honoring any active deny pin.
    ///
    /// `cost = 0` peeks: it bypasses the pin, never mutates, and always
    /// passes, reporting the interpolated remaining budget.
    pub fn apply(&self, key: &str, now_ms: u64, limit: u64, duration_ms: u64, cost: u64) -> WindowDecision {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| CounterSlot::new(now_ms, duration_ms));
        slot.last_access_ms = now_ms;

        if cost > 0 && slot.deny_until_ms > now_ms {
            return WindowDecision {
                passed: false,
                remaining: 0,
                reset_at_ms: slot.deny_until_ms,
                current: slot.window.current,
            };
        }

        slot.window.apply(now_ms, duration_ms, limit, cost)
    }

    /// Fold a remote delta into the authoritative counter (owner side).
    ///
    /// Reports whether the count just crossed the limit so the caller can
    /// broadcast exactly once per window.
    pub fn apply_delta(
        &self,
        key: &str,
        now_ms: u64,
        limit: u64,
        duration_ms: u64,
        window_start_ms: u64,
        delta: u64,
    ) -> PushOutcome {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| CounterSlot::new(now_ms, duration_ms));
        slot.last_access_ms = now_ms;

        slot.window.absorb(now_ms, duration_ms, window_start_ms, delta);
        let effective = slot.window.effective(now_ms, duration_ms);
        let reset_at_ms = slot.window.reset_at_ms(duration_ms);
        let exceeded = effective > limit as f64;

        let crossed = exceeded && slot.exceeded_window_start_ms != slot.window.current_start_ms;
        if crossed {
            slot.exceeded_window_start_ms = slot.window.current_start_ms;
        }

        PushOutcome {
            current: slot.window.current,
            passed: !exceeded,
            reset_at_ms,
            crossed,
        }
    }

    /// Converge a shadow counter toward the owner's authoritative count.
    pub fn converge(&self, key: &str, now_ms: u64, duration_ms: u64, window_start_ms: u64, authoritative: u64) {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| CounterSlot::new(now_ms, duration_ms));
        slot.last_access_ms = now_ms;
        slot.window.converge(now_ms, duration_ms, window_start_ms, authoritative);
    }

    /// Pin the counter to deny until `reset_at_ms`.
    ///
    /// Last-writer-wins on the farthest reset; stale pins (in the past) are
    /// ignored.
    pub fn pin_exceeded(&self, key: &str, now_ms: u64, duration_ms: u64, reset_at_ms: u64) {
        if reset_at_ms <= now_ms {
            return;
        }
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| CounterSlot::new(now_ms, duration_ms));
        slot.last_access_ms = now_ms;
        slot.deny_until_ms = slot.deny_until_ms.max(reset_at_ms);
    }

    /// Drop counters idle for at least twice their window duration.
    ///
    /// Returns the number of evicted counters.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            let idle_limit = slot.duration_ms.saturating_mul(COUNTER_IDLE_FACTOR);
            let idle = now_ms.saturating_sub(slot.last_access_ms);
            idle < idle_limit || slot.deny_until_ms > now_ms
        });
        before.saturating_sub(self.slots.len())
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table holds no counters.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
