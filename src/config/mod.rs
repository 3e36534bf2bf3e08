//! Process configuration.
//!
//! All settings are environment-overridable (`TURNSTILE_*`) with defaults
//! suitable for a single-node deployment. Validation runs once at startup;
//! any violation aborts with exit code 1.

pub mod error;
pub mod loader;

pub use error::ConfigError;

use crate::constants;
use crate::impl_config_loader;

/// Which discovery backend seeds the peer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    /// Compiled-in peer list; deterministic, used for tests and fixed fleets.
    #[default]
    Static,
    /// Shared registry with TTL heartbeats.
    Registry,
}

impl DiscoveryMode {
    /// Parse from the string representation used in the environment.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "static" => Some(Self::Static),
            "registry" => Some(Self::Registry),
            _ => None,
        }
    }

    /// String representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Registry => "registry",
        }
    }
}

/// Identity and addressing of this node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable ID for the lifetime of the process. Generated when empty.
    pub node_id: String,
    /// Address other cluster members use to reach this node.
    pub advertise_addr: String,
    /// Opaque edge-location tag prepended to identifiers under edge sharding.
    pub edge_tag: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            advertise_addr: "127.0.0.1".to_string(),
            edge_tag: String::new(),
        }
    }
}

impl_config_loader!(NodeConfig {
    node_id: "TURNSTILE_NODE_ID",
    advertise_addr: "TURNSTILE_ADVERTISE_ADDR",
    edge_tag: "TURNSTILE_EDGE_TAG",
});

/// Public HTTP API settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Port the public API listens on.
    pub http_port: u16,
    /// Root keys in `token=workspace_id` form, comma separated.
    ///
    /// Placeholder for the external auth middleware; see `server::auth`.
    pub root_keys: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            root_keys: Vec::new(),
        }
    }
}

impl_config_loader!(HttpConfig {
    http_port: "TURNSTILE_HTTP_PORT",
    root_keys: "TURNSTILE_ROOT_KEYS",
});

/// Cluster fabric settings: ports, discovery, gossip timing.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// TCP port for peer RPC.
    pub rpc_port: u16,
    /// UDP port for gossip.
    pub gossip_port: u16,
    /// Discovery backend, `static` or `registry`.
    pub discovery_mode: String,
    /// Static peers as `node_id@host:rpc_port:gossip_port`, comma separated.
    pub static_peers: Vec<String>,
    /// Base URL of the shared registry (registry mode only).
    pub registry_url: String,
    /// Interval between registry heartbeats.
    pub heartbeat_interval_ms: u64,
    /// TTL attached to registry records.
    pub registry_ttl_ms: u64,
    /// Interval between gossip rounds.
    pub probe_interval_ms: u64,
    /// Deadline for a probe acknowledgement.
    pub probe_timeout_ms: u64,
    /// Grace window before a suspect is declared dead. 0 = 5x probe interval.
    pub suspect_timeout_ms: u64,
    /// Peers contacted per gossip round.
    pub gossip_fanout: usize,
    /// Deadline for a peer RPC round trip.
    pub rpc_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            rpc_port: 7070,
            gossip_port: 7071,
            discovery_mode: DiscoveryMode::Static.as_str().to_string(),
            static_peers: Vec::new(),
            registry_url: String::new(),
            heartbeat_interval_ms: constants::DEFAULT_HEARTBEAT_INTERVAL_MS,
            registry_ttl_ms: constants::DEFAULT_REGISTRY_TTL_MS,
            probe_interval_ms: constants::DEFAULT_PROBE_INTERVAL_MS,
            probe_timeout_ms: constants::DEFAULT_PROBE_TIMEOUT_MS,
            suspect_timeout_ms: 0,
            gossip_fanout: constants::DEFAULT_GOSSIP_FANOUT,
            rpc_timeout_ms: constants::DEFAULT_RPC_TIMEOUT_MS,
        }
    }
}

impl_config_loader!(ClusterConfig {
    rpc_port: "TURNSTILE_RPC_PORT",
    gossip_port: "TURNSTILE_GOSSIP_PORT",
    discovery_mode: "TURNSTILE_DISCOVERY_MODE",
    static_peers: "TURNSTILE_STATIC_PEERS",
    registry_url: "TURNSTILE_REGISTRY_URL",
    heartbeat_interval_ms: "TURNSTILE_HEARTBEAT_INTERVAL_MS",
    registry_ttl_ms: "TURNSTILE_REGISTRY_TTL_MS",
    probe_interval_ms: "TURNSTILE_PROBE_INTERVAL_MS",
    probe_timeout_ms: "TURNSTILE_PROBE_TIMEOUT_MS",
    suspect_timeout_ms: "TURNSTILE_SUSPECT_TIMEOUT_MS",
    gossip_fanout: "TURNSTILE_GOSSIP_FANOUT",
    rpc_timeout_ms: "TURNSTILE_RPC_TIMEOUT_MS",
});

impl ClusterConfig {
    /// Effective suspect grace window.
    pub fn effective_suspect_timeout_ms(&self) -> u64 {
        if self.suspect_timeout_ms > 0 {
            self.suspect_timeout_ms
        } else {
            self.probe_interval_ms * constants::SUSPECT_TIMEOUT_FACTOR
        }
    }
}

/// In-process cache tier settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries held before FIFO eviction kicks in.
    pub max_items: usize,
    /// Probability in [0, 1] that a `set` sweeps expired entries.
    pub evict_frequency: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: constants::DEFAULT_CACHE_MAX_ITEMS,
            evict_frequency: constants::DEFAULT_CACHE_EVICT_FREQUENCY,
        }
    }
}

impl_config_loader!(CacheConfig {
    max_items: "TURNSTILE_CACHE_MAX_ITEMS",
    evict_frequency: "TURNSTILE_CACHE_EVICT_FREQUENCY",
});

/// Limiter coordination settings: batching and circuit breaking.
#[derive(Debug, Clone)]
pub struct RatelimitConfig {
    /// Interval between batch flushes to origin nodes.
    pub batch_flush_interval_ms: u64,
    /// Byte cap that forces an early flush.
    pub batch_max_bytes: usize,
    /// Buffered deltas per origin before the oldest are dropped.
    pub batch_capacity: usize,
    /// Failures within the window that open an origin breaker.
    pub breaker_failure_threshold: u32,
    /// Rolling window over which breaker failures are counted.
    pub breaker_window_ms: u64,
    /// Cooldown before an open breaker admits a probe.
    pub breaker_cooldown_ms: u64,
}

impl Default for RatelimitConfig {
    fn default() -> Self {
        Self {
            batch_flush_interval_ms: constants::DEFAULT_BATCH_FLUSH_INTERVAL_MS,
            batch_max_bytes: constants::DEFAULT_BATCH_MAX_BYTES,
            batch_capacity: constants::DEFAULT_BATCH_CAPACITY,
            breaker_failure_threshold: constants::DEFAULT_BREAKER_FAILURE_THRESHOLD,
            breaker_window_ms: constants::DEFAULT_BREAKER_WINDOW_MS,
            breaker_cooldown_ms: constants::DEFAULT_BREAKER_COOLDOWN_MS,
        }
    }
}

impl_config_loader!(RatelimitConfig {
    batch_flush_interval_ms: "TURNSTILE_BATCH_FLUSH_INTERVAL_MS",
    batch_max_bytes: "TURNSTILE_BATCH_MAX_BYTES",
    batch_capacity: "TURNSTILE_BATCH_CAPACITY",
    breaker_failure_threshold: "TURNSTILE_BREAKER_FAILURE_THRESHOLD",
    breaker_window_ms: "TURNSTILE_BREAKER_WINDOW_MS",
    breaker_cooldown_ms: "TURNSTILE_BREAKER_COOLDOWN_MS",
});

/// Full process configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Node identity and addressing.
    pub node: NodeConfig,
    /// Public HTTP API.
    pub http: HttpConfig,
    /// Cluster fabric.
    pub cluster: ClusterConfig,
    /// In-process cache tier.
    pub cache: CacheConfig,
    /// Limiter coordination.
    pub ratelimit: RatelimitConfig,
}

impl Config {
    /// Load from the environment and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            node: NodeConfig::load(),
            http: HttpConfig::load(),
            cluster: ClusterConfig::load(),
            cache: CacheConfig::load(),
            ratelimit: RatelimitConfig::load(),
        };

        if config.node.node_id.is_empty() {
            config.node.node_id = format!("node-{}", uuid::Uuid::new_v4());
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mode = DiscoveryMode::parse(&self.cluster.discovery_mode).ok_or_else(|| {
            ConfigError::invalid("TURNSTILE_DISCOVERY_MODE", "expected `static` or `registry`")
        })?;

        if mode == DiscoveryMode::Registry && self.cluster.registry_url.is_empty() {
            return Err(ConfigError::missing(
                "TURNSTILE_REGISTRY_URL",
                "registry discovery requires a registry URL",
            ));
        }

        if !(0.0..=1.0).contains(&self.cache.evict_frequency) {
            return Err(ConfigError::invalid(
                "TURNSTILE_CACHE_EVICT_FREQUENCY",
                "must be within [0, 1]",
            ));
        }

        if self.cluster.probe_interval_ms == 0 {
            return Err(ConfigError::invalid("TURNSTILE_PROBE_INTERVAL_MS", "must be positive"));
        }

        if self.cluster.gossip_fanout == 0 {
            return Err(ConfigError::invalid("TURNSTILE_GOSSIP_FANOUT", "must be at least 1"));
        }

        if self.ratelimit.batch_capacity == 0 {
            return Err(ConfigError::invalid("TURNSTILE_BATCH_CAPACITY", "must be positive"));
        }

        for peer in &self.cluster.static_peers {
            if crate::cluster::Member::parse_static(peer).is_none() {
                return Err(ConfigError::invalid(
                    "TURNSTILE_STATIC_PEERS",
                    format!("malformed peer `{peer}`, expected node_id@host:rpc_port:gossip_port"),
                ));
            }
        }

        Ok(())
    }

    /// Parsed discovery mode; `validate` guarantees this succeeds.
    pub fn discovery_mode(&self) -> DiscoveryMode {
        DiscoveryMode::parse(&self.cluster.discovery_mode).unwrap_or_default()
    }
}
