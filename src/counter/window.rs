//! Sliding-window accounting for a single counter.
//!
//! A counter holds two adjacent fixed windows of length `duration` and
//! interpolates between them: the previous window's count decays linearly as
//! the current window fills. All functions here are pure over an explicit
//! `now_ms` so the math is testable without a clock.

use serde::Deserialize;
use serde::Serialize;

/// Start of the fixed window containing `now_ms`.
#[inline]
pub fn window_start(now_ms: u64, duration_ms: u64) -> u64 {
    debug_assert!(duration_ms > 0, "duration must be positive");
    (now_ms / duration_ms) * duration_ms
}

/// Outcome of applying a cost to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether the request was admitted.
    pub passed: bool,
    /// Units left before the limit, after this decision.
    pub remaining: u64,
    /// When the current window closes (Unix ms).
    pub reset_at_ms: u64,
    /// Count in the current window after this decision.
    pub current: u64,
}

/// Two adjacent fixed windows with linear interpolation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlidingWindow {
    /// Start of the current window (Unix ms, multiple of duration).
    pub current_start_ms: u64,
    /// Count accumulated in the current window.
    pub current: u64,
    /// Count accumulated in the window immediately before the current one.
    pub previous: u64,
}

impl SlidingWindow {
    /// Fresh counter for the window containing `now_ms`.
    pub fn new(now_ms: u64, duration_ms: u64) -> Self {
        Self {
            current_start_ms: window_start(now_ms, duration_ms),
            current: 0,
            previous: 0,
        }
    }

    /// Advance to the window containing `now_ms`.
    ///
    /// If exactly one window elapsed the current count becomes the previous
    /// count; after a longer gap both windows are empty. `now_ms` earlier
    /// than the stored window is ignored (clock skew tolerance).
    pub fn roll(&mut self, now_ms: u64, duration_ms: u64) {
        let start = window_start(now_ms, duration_ms);
        if start == self.current_start_ms || start < self.current_start_ms {
            return;
        }
        if start == self.current_start_ms + duration_ms {
            self.previous = self.current;
        } else {
            self.previous = 0;
        }
        self.current = 0;
        self.current_start_ms = start;
    }

    /// Interpolated count at `now_ms`. Assumes the window has been rolled.
    pub fn effective(&self, now_ms: u64, duration_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.current_start_ms);
        let weight = 1.0 - (elapsed as f64 / duration_ms as f64).min(1.0);
        self.current as f64 + weight * self.previous as f64
    }

    /// When the current window closes.
    #[inline]
    pub fn reset_at_ms(&self, duration_ms: u64) -> u64 {
        self.current_start_ms + duration_ms
    }

    /// Apply `cost` against `limit` at `now_ms`.
    ///
    /// `cost = 0` is a peek: it never mutates state and always passes.
    pub fn apply(&mut self, now_ms: u64, duration_ms: u64, limit: u64, cost: u64) -> WindowDecision {
        self.roll(now_ms, duration_ms);
        let effective = self.effective(now_ms, duration_ms);
        let reset_at_ms = self.reset_at_ms(duration_ms);

        if cost == 0 {
            return WindowDecision {
                passed: true,
                remaining: remaining(limit, effective),
                reset_at_ms,
                current: self.current,
            };
        }

        if effective + cost as f64 <= limit as f64 {
            self.current = self.current.saturating_add(cost);
            WindowDecision {
                passed: true,
                remaining: remaining(limit, effective + cost as f64),
                reset_at_ms,
                current: self.current,
            }
        } else {
            WindowDecision {
                passed: false,
                remaining: remaining(limit, effective),
                reset_at_ms,
                current: self.current,
            }
        }
    }

    /// Fold a remote delta into the window for `window_start_ms`.
    ///
    /// Deltas for the current window add to `current`, deltas for the
    /// immediately preceding window add to `previous`, anything older is
    /// dropped as stale.
    pub fn absorb(&mut self, now_ms: u64, duration_ms: u64, window_start_ms: u64, delta: u64) {
        self.roll(now_ms, duration_ms);
        if window_start_ms == self.current_start_ms {
            self.current = self.current.saturating_add(delta);
        } else if window_start_ms + duration_ms == self.current_start_ms {
            self.previous = self.previous.saturating_add(delta);
        }
    }

    /// Replace the current count with a larger authoritative value.
    ///
    /// Used by non-owners to converge their shadow toward the origin; the
    /// max-merge never loses locally admitted cost.
    pub fn converge(&mut self, now_ms: u64, duration_ms: u64, window_start_ms: u64, authoritative: u64) {
        self.roll(now_ms, duration_ms);
        if window_start_ms == self.current_start_ms {
            self.current = self.current.max(authoritative);
        } else if window_start_ms + duration_ms == self.current_start_ms {
            self.previous = self.previous.max(authoritative);
        }
    }
}

/// `max(0, limit - ceil(effective))` as an integer.
#[inline]
fn remaining(limit: u64, effective: f64) -> u64 {
    let used = effective.ceil() as u64;
    limit.saturating_sub(used)
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: u64 = 60_000;

    #[test]
    fn window_start_is_floor() {
        assert_eq!(window_start(0, 1_000), 0);
        assert_eq!(window_start(999, 1_000), 0);
        assert_eq!(window_start(1_000, 1_000), 1_000);
        assert_eq!(window_start(61_500, D), 60_000);
    }

    #[test]
    fn burst_within_one_window() {
        // Spec scenario: limit=10, 12 calls of cost=1 within one window.
        let mut w = SlidingWindow::new(0, D);
        let mut passes = 0;
        let mut last_remaining = u64::MAX;
        for i in 0..12u64 {
            let d = w.apply(i * 10, D, 10, 1);
            if d.passed {
                passes += 1;
                assert!(d.remaining < last_remaining);
                last_remaining = d.remaining;
            } else {
                assert_eq!(d.remaining, 0);
            }
            assert_eq!(d.reset_at_ms, D);
        }
        assert_eq!(passes, 10);
        assert_eq!(last_remaining, 0);
    }

    #[test]
    fn peek_never_mutates_and_passes() {
        let mut w = SlidingWindow::new(0, D);
        for _ in 0..10 {
            w.apply(0, D, 10, 1);
        }
        let before = w;
        let d = w.apply(1, D, 10, 0);
        assert!(d.passed);
        assert_eq!(d.remaining, 0);
        assert_eq!(w, before);
    }

    #[test]
    fn sliding_edge_interpolates() {
        // Spec scenario: limit=10, duration=1s. Fill window 0 with 10,
        // then at t=1500 the previous window weighs 0.5.
        let mut w = SlidingWindow::new(0, 1_000);
        for _ in 0..10 {
            assert!(w.apply(0, 1_000, 10, 1).passed);
        }
        // t=500, same window: effective = 10, deny.
        assert!(!w.apply(500, 1_000, 10, 1).passed);

        // t=1500: previous=10 at weight 0.5 → effective 5, first 5 pass.
        for i in 0..5 {
            let d = w.apply(1_500, 1_000, 10, 1);
            assert!(d.passed, "call {i} should pass");
        }
        assert!(!w.apply(1_500, 1_000, 10, 1).passed);
    }

    #[test]
    fn roll_after_gap_clears_both_windows() {
        let mut w = SlidingWindow::new(0, 1_000);
        w.apply(0, 1_000, 10, 10);
        w.roll(5_000, 1_000);
        assert_eq!(w.current, 0);
        assert_eq!(w.previous, 0);
        assert_eq!(w.current_start_ms, 5_000);
    }

    #[test]
    fn exact_fill_then_deny() {
        let mut w = SlidingWindow::new(0, D);
        // cost = limit exactly fills.
        assert!(w.apply(0, D, 10, 10).passed);
        // cost = 1 on a full window denies.
        assert!(!w.apply(1, D, 10, 1).passed);
    }

    #[test]
    fn cost_above_limit_always_denies() {
        let mut w = SlidingWindow::new(0, D);
        let d = w.apply(0, D, 10, 11);
        assert!(!d.passed);
        assert_eq!(d.current, 0);
    }

    #[test]
    fn absorb_routes_by_window() {
        let mut w = SlidingWindow::new(2_000, 1_000);
        w.absorb(2_000, 1_000, 2_000, 3); // current
        w.absorb(2_000, 1_000, 1_000, 2); // previous
        w.absorb(2_000, 1_000, 0, 9); // stale, dropped
        assert_eq!(w.current, 3);
        assert_eq!(w.previous, 2);
    }

    #[test]
    fn converge_is_max_merge() {
        let mut w = SlidingWindow::new(0, 1_000);
        w.apply(0, 1_000, 100, 7);
        w.converge(0, 1_000, 0, 5);
        assert_eq!(w.current, 7);
        w.converge(0, 1_000, 0, 12);
        assert_eq!(w.current, 12);
    }

    #[test]
    fn minimum_duration_rolls_on_second_boundaries() {
        let mut w = SlidingWindow::new(0, 1_000);
        w.apply(999, 1_000, 10, 1);
        assert_eq!(w.current_start_ms, 0);
        w.apply(1_000, 1_000, 10, 1);
        assert_eq!(w.current_start_ms, 1_000);
        assert_eq!(w.previous, 1);
    }
}
