//! Limiter coordination: the `limit` operation and its supporting tasks.
//!
//! [`RatelimitService`] is the hot path; [`BatchFlusher`] converges async
//! admissions to their origin nodes; [`CircuitBreaker`] keeps a flapping
//! origin from stalling sync calls.

pub mod batch;
pub mod breaker;
pub mod service;
pub mod types;

pub use batch::BatchFlusher;
pub use batch::BatchQueue;
pub use batch::Delta;
pub use breaker::BreakerConfig;
pub use breaker::CircuitBreaker;
pub use service::RatelimitService;
pub use types::CoordinatorStats;
pub use types::CoordinatorStatsSnapshot;
pub use types::RatelimitError;
pub use types::RatelimitRequest;
pub use types::RatelimitResponse;
