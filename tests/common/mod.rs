//! Shared fixtures: in-process clusters wired over loopback RPC.
//!
//! Cluster tests pre-seed every node's membership with the full member set
//! (a deterministic static cluster) instead of waiting on gossip, and run on
//! a manual clock pinned to a window boundary so sliding-window math is
//! exact. Gossip convergence itself is covered by the gossip module's own
//! tests.

#![allow(dead_code)]

use std::sync::Arc;

use turnstile::cluster::membership::Membership;
use turnstile::cluster::rpc::PeerClient;
use turnstile::cluster::rpc::RpcServer;
use turnstile::cluster::types::Member;
use turnstile::cluster::types::NodeId;
use turnstile::counter::CounterMap;
use turnstile::config::CacheConfig;
use turnstile::overrides::resolver::OverrideResolver;
use turnstile::overrides::store::MemoryPrimaryStore;
use turnstile::ratelimit::batch::BatchFlusher;
use turnstile::ratelimit::breaker::BreakerConfig;
use turnstile::ratelimit::breaker::CircuitBreaker;
use turnstile::ratelimit::service::RatelimitService;
use turnstile::ratelimit::types::CoordinatorStats;
use turnstile::ratelimit::types::RatelimitError;
use turnstile::ratelimit::types::RatelimitRequest;
use turnstile::ratelimit::types::RatelimitResponse;
use turnstile::time::ManualTimeProvider;
use turnstile::time::TimeProvider;

/// Logical test epoch: a multiple of every window duration the tests use.
pub const EPOCH_MS: u64 = 60_000_000;

/// One in-process node with a live RPC server.
pub struct TestNode {
    pub node_id: NodeId,
    pub service: Arc<RatelimitService>,
    pub membership: Arc<Membership>,
    pub stats: Arc<CoordinatorStats>,
    pub rpc: Option<RpcServer>,
    pub flusher: Option<BatchFlusher>,
}

impl TestNode {
    /// Issue a limit call as workspace `ws` against namespace `ns`.
    pub async fn limit(
        &self,
        identifier: &str,
        limit: u64,
        duration_ms: u64,
        cost: u64,
        async_mode: bool,
    ) -> Result<RatelimitResponse, RatelimitError> {
        self.service
            .limit(
                &RatelimitRequest {
                    workspace_id: "ws".to_string(),
                    namespace: "ns".to_string(),
                    identifier: identifier.to_string(),
                    limit,
                    duration_ms,
                    cost,
                    async_mode,
                },
                true,
            )
            .await
    }

    /// Kill this node's RPC server, simulating a crashed owner.
    pub async fn kill_rpc(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            rpc.shutdown().await;
        }
    }
}

/// A deterministic static cluster over loopback.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub store: Arc<MemoryPrimaryStore>,
    pub time: ManualTimeProvider,
}

impl TestCluster {
    /// Spawn `n` nodes sharing one primary store and full mutual membership.
    pub async fn spawn(n: usize) -> Self {
        let time = ManualTimeProvider::starting_at(EPOCH_MS);
        let shared_time: Arc<dyn TimeProvider> = Arc::new(time.clone());
        let store = Arc::new(MemoryPrimaryStore::new());

        // Reserve one loopback port per node.
        let mut ports = Vec::with_capacity(n);
        for _ in 0..n {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            ports.push(listener.local_addr().unwrap().port());
            drop(listener);
        }

        let members: Vec<Member> = (0..n)
            .map(|i| Member {
                node_id: NodeId::new(format!("node-{i}")),
                advertise_addr: "127.0.0.1".to_string(),
                rpc_port: ports[i],
                gossip_port: 0,
                joined_at_ms: EPOCH_MS,
            })
            .collect();

        let mut nodes = Vec::with_capacity(n);
        for member in &members {
            let membership = Arc::new(Membership::new(member.clone(), EPOCH_MS));
            membership.seed(members.clone(), EPOCH_MS);

            let resolver = Arc::new(OverrideResolver::with_memory_cache(
                store.clone(),
                &CacheConfig::default(),
                shared_time.clone(),
            ));
            let counters = Arc::new(CounterMap::new());
            let client = Arc::new(PeerClient::new(250));
            let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
                failure_threshold: 3,
                window_ms: 1_000,
                cooldown_ms: 300,
            }));
            let stats = Arc::new(CoordinatorStats::default());

            let flusher = BatchFlusher::spawn(
                1_024,
                1 << 20,
                20,
                membership.clone(),
                client.clone(),
                counters.clone(),
                breaker.clone(),
                stats.clone(),
                shared_time.clone(),
            );
            let service = Arc::new(RatelimitService::new(
                membership.clone(),
                counters,
                resolver,
                client,
                flusher.queue(),
                breaker,
                stats.clone(),
                shared_time.clone(),
                String::new(),
            ));
            let rpc = RpcServer::bind(
                &format!("127.0.0.1:{}", member.rpc_port),
                membership.clone(),
                service.clone(),
            )
            .await
            .unwrap();

            nodes.push(TestNode {
                node_id: member.node_id.clone(),
                service,
                membership,
                stats,
                rpc: Some(rpc),
                flusher: Some(flusher),
            });
        }

        Self { nodes, store, time }
    }

    /// The namespace ID behind `(ws, ns)`, once something has created it.
    pub async fn namespace_id(&self) -> String {
        use turnstile::overrides::store::NamespaceStore;
        self.store
            .find_namespace("ws", "ns")
            .await
            .unwrap()
            .expect("namespace not created yet")
            .id
    }

    /// Index of the node owning `identifier` (per node 0's ring).
    pub async fn owner_index(&self, identifier: &str) -> usize {
        let namespace_id = self.namespace_id().await;
        let ring = self.nodes[0].membership.ring();
        let owner = ring.owner(&format!("{namespace_id}:{identifier}")).unwrap().clone();
        self.nodes
            .iter()
            .position(|node| node.node_id == owner)
            .expect("owner not in cluster")
    }

    /// An identifier whose owner is `target` (per node 0's ring), found by
    /// probing a deterministic sequence.
    pub async fn identifier_owned_by(&self, target: usize, limit: u64, duration_ms: u64) -> String {
        // Create the namespace first so the ring key is stable.
        let _ = self.nodes[0].limit("bootstrap", limit, duration_ms, 0, true).await.unwrap();
        for i in 0..10_000 {
            let candidate = format!("probe-{i}");
            if self.owner_index(&candidate).await == target {
                return candidate;
            }
        }
        panic!("no identifier found for node {target}");
    }

    /// Tear every node down.
    pub async fn shutdown(self) {
        for mut node in self.nodes {
            if let Some(rpc) = node.rpc.take() {
                rpc.shutdown().await;
            }
            if let Some(flusher) = node.flusher.take() {
                flusher.shutdown().await;
            }
        }
    }
}
