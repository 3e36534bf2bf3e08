//! Cluster-coordinated sliding-window rate limiter.
//!
//! The core of an API-key gateway: sub-millisecond limit decisions at the
//! edge, converging asynchronously to a per-counter origin node located via
//! a consistent-hash ring over the gossip-maintained member set.
//!
//! # Architecture
//!
//! - [`counter`]: interpolated two-window counters in a sharded table.
//! - [`cache`]: tiered stale-while-revalidate cache with single-flight.
//! - [`overrides`]: namespaces, override CRUD, and wildcard policy
//!   resolution backed by the cache.
//! - [`cluster`]: discovery, gossip membership, hash ring, and peer RPC.
//! - [`ratelimit`]: the coordinator composing the above into `limit`.
//! - [`server`]: the public HTTP surface.
//!
//! Counters are ephemeral by design: nothing survives a restart, and the
//! cluster accepts bounded overshoot in exchange for keeping the hot path
//! local.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod counter;
pub mod error;
pub mod node;
pub mod overrides;
pub mod ratelimit;
pub mod registry;
pub mod server;
pub mod time;

pub use config::Config;
pub use error::ErrorBody;
pub use error::ErrorCode;
pub use node::BootstrapError;
pub use node::Node;
pub use ratelimit::RatelimitRequest;
pub use ratelimit::RatelimitResponse;
pub use ratelimit::RatelimitService;
