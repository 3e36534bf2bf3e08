//! Multi-tier cache with stale-while-revalidate semantics.
//!
//! Backs the override resolver's namespace and override-set lookups. The
//! chain is `[memory, optional shared store]`; stores are swappable at
//! construction via the [`CacheStore`] capability.

pub mod entry;
pub mod error;
pub mod single_flight;
pub mod store;
pub mod tiered;

pub use entry::CacheEntry;
pub use entry::CacheTtl;
pub use error::CacheError;
pub use single_flight::SingleFlight;
pub use store::CacheStore;
pub use store::MemoryStore;
pub use tiered::TieredCache;
