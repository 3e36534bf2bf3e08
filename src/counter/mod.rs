//! Sliding-window counters (in-memory, per process).
//!
//! The leaf of the rate limiter: pure window math in [`window`], and the
//! shared sharded table in [`map`]. Ownership semantics live a level up in
//! the coordinator; this module neither knows nor cares whether a counter is
//! authoritative or a shadow.

pub mod map;
pub mod window;

pub use map::CounterMap;
pub use map::PushOutcome;
pub use map::sequence_key;
pub use window::SlidingWindow;
pub use window::WindowDecision;
pub use window::window_start;
