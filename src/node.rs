//! Node bootstrap and lifecycle.
//!
//! Construction order matters: the membership view exists first, the RPC and
//! gossip sockets bind against it, and discovery runs last so a failure to
//! reach the initial peer set can abort startup cleanly (exit code 2).
//! Shutdown is cooperative and runs in reverse: unregister from discovery,
//! stop gossip and RPC, drain the batch flusher.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use crate::cluster::discovery::Discovery;
use crate::cluster::discovery::DiscoveryHandle;
use crate::cluster::discovery::HttpRegistryDiscovery;
use crate::cluster::discovery::StaticDiscovery;
use crate::cluster::error::ClusterError;
use crate::cluster::gossip::GossipConfig;
use crate::cluster::gossip::GossipService;
use crate::cluster::membership::Membership;
use crate::cluster::rpc::PeerClient;
use crate::cluster::rpc::RpcServer;
use crate::cluster::types::Member;
use crate::cluster::types::NodeId;
use crate::config::Config;
use crate::config::ConfigError;
use crate::config::DiscoveryMode;
use crate::constants::COUNTER_SWEEP_INTERVAL_MS;
use crate::counter::CounterMap;
use crate::overrides::admin::OverrideAdmin;
use crate::overrides::resolver::OverrideResolver;
use crate::overrides::store::MemoryPrimaryStore;
use crate::overrides::store::PrimaryStore;
use crate::ratelimit::batch::BatchFlusher;
use crate::ratelimit::breaker::BreakerConfig;
use crate::ratelimit::breaker::CircuitBreaker;
use crate::ratelimit::service::RatelimitService;
use crate::ratelimit::types::CoordinatorStats;
use crate::server::AppState;
use crate::server::Authorizer;
use crate::server::StaticAuthorizer;
use crate::server::build_router;
use crate::time::SystemTimeProvider;
use crate::time::TimeProvider;

/// Startup failures, split by exit code.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Invalid configuration (exit code 1).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Initial discovery could not be reached (exit code 2).
    #[error("initial discovery failed: {0}")]
    Discovery(ClusterError),

    /// Any other startup failure (exit code 3).
    #[error("startup failed: {0}")]
    Runtime(ClusterError),
}

/// A running node: all long-lived tasks plus the HTTP state.
pub struct Node {
    config: Config,
    membership: Arc<Membership>,
    state: AppState,
    discovery: Arc<dyn Discovery>,
    discovery_handle: DiscoveryHandle,
    gossip: GossipService,
    rpc_server: RpcServer,
    flusher: BatchFlusher,
    janitor_shutdown: watch::Sender<bool>,
    janitor: JoinHandle<()>,
}

impl Node {
    /// Bootstrap with the in-memory primary store and config-driven auth.
    pub async fn bootstrap(config: Config) -> Result<Self, BootstrapError> {
        let authorizer: Arc<dyn Authorizer> = Arc::new(StaticAuthorizer::from_entries(&config.http.root_keys));
        Self::bootstrap_with(config, Arc::new(MemoryPrimaryStore::new()), authorizer).await
    }

    /// Bootstrap with explicit store and authorizer implementations.
    pub async fn bootstrap_with(
        config: Config,
        store: Arc<dyn PrimaryStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, BootstrapError> {
        config.validate()?;
        let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let now_ms = time.now_unix_ms();

        let local = Member {
            node_id: NodeId::new(config.node.node_id.clone()),
            advertise_addr: config.node.advertise_addr.clone(),
            rpc_port: config.cluster.rpc_port,
            gossip_port: config.cluster.gossip_port,
            joined_at_ms: now_ms,
        };
        info!(node = %local.node_id, rpc = local.rpc_port, gossip = local.gossip_port, "bootstrapping node");
        let membership = Arc::new(Membership::new(local, now_ms));

        let resolver = Arc::new(OverrideResolver::with_memory_cache(store.clone(), &config.cache, time.clone()));
        let counters = Arc::new(CounterMap::new());
        let client = Arc::new(PeerClient::new(config.cluster.rpc_timeout_ms));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::from(&config.ratelimit)));
        let stats = Arc::new(CoordinatorStats::default());

        let flusher = BatchFlusher::spawn(
            config.ratelimit.batch_capacity,
            config.ratelimit.batch_max_bytes,
            config.ratelimit.batch_flush_interval_ms,
            membership.clone(),
            client.clone(),
            counters.clone(),
            breaker.clone(),
            stats.clone(),
            time.clone(),
        );

        let service = Arc::new(RatelimitService::new(
            membership.clone(),
            counters.clone(),
            resolver.clone(),
            client,
            flusher.queue(),
            breaker,
            stats,
            time.clone(),
            config.node.edge_tag.clone(),
        ));

        let rpc_server = RpcServer::bind(
            &format!("0.0.0.0:{}", config.cluster.rpc_port),
            membership.clone(),
            service.clone(),
        )
        .await
        .map_err(BootstrapError::Runtime)?;

        let static_peers = StaticDiscovery::from_entries(&config.cluster.static_peers)
            .map_err(BootstrapError::Discovery)?;
        let seeds: Vec<String> = match config.discovery_mode() {
            DiscoveryMode::Static => static_peers
                .list()
                .await
                .map_err(BootstrapError::Discovery)?
                .iter()
                .map(Member::gossip_addr)
                .collect(),
            DiscoveryMode::Registry => Vec::new(),
        };
        let gossip = GossipService::bind(
            &format!("0.0.0.0:{}", config.cluster.gossip_port),
            membership.clone(),
            GossipConfig::from(&config.cluster),
            seeds,
            time.clone(),
        )
        .await
        .map_err(BootstrapError::Runtime)?;

        let discovery: Arc<dyn Discovery> = match config.discovery_mode() {
            DiscoveryMode::Static => Arc::new(static_peers),
            DiscoveryMode::Registry => Arc::new(HttpRegistryDiscovery::new(
                config.cluster.registry_url.clone(),
                config.cluster.registry_ttl_ms,
            )),
        };
        let discovery_handle = DiscoveryHandle::start(
            discovery.clone(),
            membership.clone(),
            config.cluster.heartbeat_interval_ms,
            time.clone(),
        )
        .await
        .map_err(BootstrapError::Discovery)?;

        // Counter janitor: evict idle counters and expired pins.
        let (janitor_shutdown, mut janitor_rx) = watch::channel(false);
        let janitor_counters = counters.clone();
        let janitor_time = time.clone();
        let janitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(COUNTER_SWEEP_INTERVAL_MS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = janitor_rx.changed() => return,
                    _ = ticker.tick() => {
                        let evicted = janitor_counters.sweep(janitor_time.now_unix_ms());
                        if evicted > 0 {
                            debug!(evicted, "counter janitor sweep");
                        }
                    }
                }
            }
        });

        let state = AppState {
            service,
            admin: Arc::new(OverrideAdmin::new(store, resolver, time)),
            authorizer,
            node_id: config.node.node_id.clone(),
        };

        Ok(Self {
            config,
            membership,
            state,
            discovery,
            discovery_handle,
            gossip,
            rpc_server,
            flusher,
            janitor_shutdown,
            janitor,
        })
    }

    /// The shared membership view.
    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// HTTP state, for embedding the router in tests.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve the public API until interrupted, then shut down cleanly.
    pub async fn serve(self) -> Result<(), ClusterError> {
        let addr = format!("0.0.0.0:{}", self.config.http.http_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %listener.local_addr()?, "public api listening");

        let router = build_router(self.state.clone());
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            })
            .await;

        self.shutdown().await;
        result.map_err(ClusterError::Io)
    }

    /// Tear down every long-lived task, in reverse construction order.
    pub async fn shutdown(self) {
        info!("node shutting down");
        let node_id = self.membership.local_node_id().clone();
        self.discovery_handle.shutdown(self.discovery.as_ref(), &node_id).await;
        self.gossip.shutdown().await;
        self.rpc_server.shutdown().await;
        self.flusher.shutdown().await;
        let _ = self.janitor_shutdown.send(true);
        let _ = self.janitor.await;
        info!("node shutdown complete");
    }
}
