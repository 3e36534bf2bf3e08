//! Per-origin circuit breaker.
//!
//! Repeated `PushCounter` failures to one owner open its breaker: sync calls
//! short-circuit to local-only decisions until the cooldown elapses, then a
//! single half-open probe decides whether to close again.

use dashmap::DashMap;
use tracing::info;

use crate::cluster::types::NodeId;
use crate::config::RatelimitConfig;

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window that open the breaker.
    pub failure_threshold: u32,
    /// Rolling window over which failures are counted.
    pub window_ms: u64,
    /// Cooldown before a half-open probe is admitted.
    pub cooldown_ms: u64,
}

impl From<&RatelimitConfig> for BreakerConfig {
    fn from(config: &RatelimitConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold,
            window_ms: config.breaker_window_ms,
            cooldown_ms: config.breaker_cooldown_ms,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { failures: u32, window_start_ms: u64 },
    Open { until_ms: u64 },
    HalfOpen,
}

/// Breaker table keyed by owner node.
pub struct CircuitBreaker {
    states: DashMap<NodeId, BreakerState>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Create a breaker table.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            states: DashMap::new(),
            config,
        }
    }

    /// Whether a call to `owner` may go out right now.
    ///
    /// An expired open breaker admits exactly one probe; concurrent callers
    /// see `false` until that probe resolves.
    pub fn allow(&self, owner: &NodeId, now_ms: u64) -> bool {
        let mut entry = self.states.entry(owner.clone()).or_insert(BreakerState::Closed {
            failures: 0,
            window_start_ms: now_ms,
        });
        match *entry {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until_ms } => {
                if now_ms >= until_ms {
                    *entry = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    /// The call to `owner` succeeded; close its breaker.
    pub fn record_success(&self, owner: &NodeId, now_ms: u64) {
        self.states.insert(owner.clone(), BreakerState::Closed {
            failures: 0,
            window_start_ms: now_ms,
        });
    }

    /// The call to `owner` failed.
    pub fn record_failure(&self, owner: &NodeId, now_ms: u64) {
        let mut entry = self.states.entry(owner.clone()).or_insert(BreakerState::Closed {
            failures: 0,
            window_start_ms: now_ms,
        });
        let next = match *entry {
            BreakerState::Closed {
                failures,
                window_start_ms,
            } => {
                let (failures, window_start_ms) = if now_ms.saturating_sub(window_start_ms) > self.config.window_ms {
                    (1, now_ms)
                } else {
                    (failures + 1, window_start_ms)
                };
                if failures >= self.config.failure_threshold {
                    info!(owner = %owner, cooldown_ms = self.config.cooldown_ms, "origin breaker opened");
                    BreakerState::Open {
                        until_ms: now_ms + self.config.cooldown_ms,
                    }
                } else {
                    BreakerState::Closed {
                        failures,
                        window_start_ms,
                    }
                }
            }
            // The half-open probe failed: back to a full cooldown.
            BreakerState::HalfOpen => BreakerState::Open {
                until_ms: now_ms + self.config.cooldown_ms,
            },
            open @ BreakerState::Open { .. } => open,
        };
        *entry = next;
    }

    /// Whether the breaker for `owner` is currently open.
    pub fn is_open(&self, owner: &NodeId, now_ms: u64) -> bool {
        match self.states.get(owner).map(|entry| *entry) {
            Some(BreakerState::Open { until_ms }) => now_ms < until_ms,
            _ => false,
        }
    }

    /// Drop state for a departed owner.
    pub fn forget(&self, owner: &NodeId) {
        self.states.remove(owner);
    }
}
