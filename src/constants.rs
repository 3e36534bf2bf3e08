//! Centralized constants for the rate limiter.
//!
//! Every bound in the system lives here so resource usage stays explicit
//! and discoverable. Constants are grouped by the subsystem they govern.

// ============================================================================
// API bounds
// ============================================================================

/// Maximum length of a namespace name in bytes.
pub const MAX_NAMESPACE_LEN: usize = 255;

/// Maximum length of an identifier in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Minimum window duration in milliseconds (1 second).
pub const MIN_DURATION_MS: u64 = 1_000;

/// Maximum window duration in milliseconds (24 hours).
pub const MAX_DURATION_MS: u64 = 86_400_000;

/// Default cost deducted per request when the caller omits it.
pub const DEFAULT_COST: u64 = 1;

/// Maximum overrides returned per list page.
pub const MAX_OVERRIDE_PAGE_SIZE: usize = 100;

/// Default overrides returned per list page.
pub const DEFAULT_OVERRIDE_PAGE_SIZE: usize = 50;

/// Upper bound on overrides fetched for a single namespace.
pub const MAX_OVERRIDES_PER_NAMESPACE: usize = 10_000;

// ============================================================================
// Cache
// ============================================================================

/// Freshness window for namespace and override cache entries.
pub const CACHE_FRESH_MS: u64 = 10_000;

/// Staleness horizon for namespace and override cache entries.
pub const CACHE_STALE_MS: u64 = 60_000;

/// Default maximum entries held by the in-process cache tier.
pub const DEFAULT_CACHE_MAX_ITEMS: usize = 100_000;

/// Default probability that a `set` triggers an expired-entry sweep.
pub const DEFAULT_CACHE_EVICT_FREQUENCY: f64 = 0.01;

// ============================================================================
// Cluster network
// ============================================================================

/// Deadline for a single peer RPC round trip.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 50;

/// Deadline for establishing a TCP connection to a peer.
pub const RPC_CONNECT_TIMEOUT_MS: u64 = 250;

/// Maximum size of a peer RPC frame in bytes.
pub const MAX_RPC_FRAME_BYTES: usize = 64 * 1024;

/// Maximum size of a gossip datagram in bytes.
pub const MAX_GOSSIP_DATAGRAM_BYTES: usize = 8 * 1024;

/// Gossip protocol version; receivers reject newer versions.
pub const GOSSIP_PROTOCOL_VERSION: u8 = 1;

/// Default interval between gossip rounds.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 1_000;

/// Default deadline for a probe to be acknowledged.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 500;

/// Default peers contacted per gossip round.
pub const DEFAULT_GOSSIP_FANOUT: usize = 3;

/// Multiplier applied to the probe interval to get the suspect grace window.
pub const SUSPECT_TIMEOUT_FACTOR: u64 = 5;

/// Upper bound on tracked cluster members.
pub const MAX_CLUSTER_MEMBERS: usize = 256;

/// Virtual positions each node occupies on the hash ring.
pub const RING_VNODES: u32 = 128;

// ============================================================================
// Discovery
// ============================================================================

/// TTL attached to registry records.
pub const DEFAULT_REGISTRY_TTL_MS: u64 = 60_000;

/// Interval between registry heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 20_000;

// ============================================================================
// Limiter coordination
// ============================================================================

/// Default interval between batch flushes to origin nodes.
pub const DEFAULT_BATCH_FLUSH_INTERVAL_MS: u64 = 100;

/// Default byte cap that forces an early batch flush.
pub const DEFAULT_BATCH_MAX_BYTES: usize = 16 * 1024;

/// Maximum buffered deltas per origin before the oldest are dropped.
pub const DEFAULT_BATCH_CAPACITY: usize = 4_096;

/// Consecutive failures within the window that open an origin breaker.
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Rolling window over which breaker failures are counted.
pub const DEFAULT_BREAKER_WINDOW_MS: u64 = 10_000;

/// Cooldown before an open breaker admits a probe request.
pub const DEFAULT_BREAKER_COOLDOWN_MS: u64 = 5_000;

/// Factor of the window duration for which replayed request IDs dedupe.
pub const RPC_DEDUPE_WINDOW_FACTOR: u64 = 2;

/// Idle multiple of the window duration after which a counter is evicted.
pub const COUNTER_IDLE_FACTOR: u64 = 2;

/// Interval between counter janitor sweeps.
pub const COUNTER_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Outer deadline applied to each limit call by the HTTP surface.
pub const DEFAULT_LIMIT_DEADLINE_MS: u64 = 1_000;
