//! Time utilities for the rate limiter.
//!
//! All wall-clock access goes through these helpers so that hot-path code
//! never panics on a misconfigured clock and tests can inject a controlled
//! time source.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before the Unix epoch (should never happen
/// on properly configured systems, but prevents panics).
#[inline]
pub fn current_time_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Get current Unix timestamp in seconds.
#[inline]
pub fn current_time_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Trait for injectable time sources.
///
/// Production code uses [`SystemTimeProvider`]; tests use
/// [`ManualTimeProvider`] to step the clock deterministically.
pub trait TimeProvider: Send + Sync + 'static {
    /// Current Unix timestamp in milliseconds.
    fn now_unix_ms(&self) -> u64;
}

/// System clock time provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        current_time_ms()
    }
}

/// Manually advanced time source for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeProvider {
    now_ms: Arc<AtomicU64>,
}

impl ManualTimeProvider {
    /// Create a provider starting at the given Unix millisecond timestamp.
    pub fn starting_at(now_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    /// Advance the clock by `delta_ms` milliseconds.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Set the clock to an absolute timestamp.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl TimeProvider for ManualTimeProvider {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_time_is_past_2020() {
        // 2020-01-01 in unix ms
        assert!(current_time_ms() > 1_577_836_800_000);
    }

    #[test]
    fn manual_time_advances() {
        let time = ManualTimeProvider::starting_at(1_000);
        assert_eq!(time.now_unix_ms(), 1_000);
        time.advance(500);
        assert_eq!(time.now_unix_ms(), 1_500);
        time.set(10_000);
        assert_eq!(time.now_unix_ms(), 10_000);
    }
}
