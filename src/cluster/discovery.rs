//! Peer discovery backends.
//!
//! Discovery only seeds the peer view; once a node has contacted any live
//! peer it learns the rest through gossip. Two interchangeable backends
//! implement the [`Discovery`] capability: a compiled-in static list and a
//! shared registry with TTL heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cluster::error::ClusterError;
use crate::cluster::membership::Membership;
use crate::cluster::types::Member;
use crate::cluster::types::NodeId;
use crate::time::TimeProvider;

/// Discovery capability: how a node announces itself and finds peers.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Announce this node.
    async fn register(&self, member: &Member) -> Result<(), ClusterError>;

    /// Withdraw this node (graceful shutdown).
    async fn unregister(&self, node_id: &NodeId) -> Result<(), ClusterError>;

    /// Current peer set as the backend sees it.
    async fn list(&self) -> Result<Vec<Member>, ClusterError>;

    /// Renew this node's registration TTL.
    async fn heartbeat(&self, node_id: &NodeId) -> Result<(), ClusterError>;
}

/// Compiled-in peer list; used for bootstrapping and deterministic test
/// clusters. Registration is a no-op.
pub struct StaticDiscovery {
    peers: Vec<Member>,
}

impl StaticDiscovery {
    /// Build from pre-parsed members.
    pub fn new(peers: Vec<Member>) -> Self {
        Self { peers }
    }

    /// Parse `node_id@host:rpc_port:gossip_port` entries; malformed entries
    /// are rejected wholesale so a typo cannot silently shrink the cluster.
    pub fn from_entries(entries: &[String]) -> Result<Self, ClusterError> {
        let mut peers = Vec::with_capacity(entries.len());
        for entry in entries {
            match Member::parse_static(entry) {
                Some(member) => peers.push(member),
                None => {
                    return Err(ClusterError::Discovery {
                        reason: format!("malformed static peer `{entry}`"),
                    });
                }
            }
        }
        Ok(Self::new(peers))
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn register(&self, _member: &Member) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn unregister(&self, _node_id: &NodeId) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Member>, ClusterError> {
        Ok(self.peers.clone())
    }

    async fn heartbeat(&self, _node_id: &NodeId) -> Result<(), ClusterError> {
        Ok(())
    }
}

/// In-process shared registry with TTL-based expiry.
///
/// Stands in for the shared registry in tests and single-host clusters:
/// every node holds an `Arc` to the same instance. Records expire when
/// their deadline passes without a heartbeat.
pub struct MemoryRegistry {
    records: RwLock<HashMap<NodeId, (Member, u64)>>,
    ttl_ms: u64,
    time: Arc<dyn TimeProvider>,
}

impl MemoryRegistry {
    /// Create a registry with the given record TTL.
    pub fn new(ttl_ms: u64, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl_ms,
            time,
        }
    }

    /// Register with an explicit TTL (the registry server honors the
    /// client-requested TTL).
    pub fn register_with_ttl(&self, member: &Member, ttl_ms: u64) {
        let deadline = self.time.now_unix_ms() + ttl_ms;
        self.records.write().insert(member.node_id.clone(), (member.clone(), deadline));
    }

    /// Drop records whose deadline has passed.
    pub fn sweep(&self) -> usize {
        let now_ms = self.time.now_unix_ms();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, (_, deadline)| *deadline > now_ms);
        before - records.len()
    }
}

#[async_trait]
impl Discovery for MemoryRegistry {
    async fn register(&self, member: &Member) -> Result<(), ClusterError> {
        let deadline = self.time.now_unix_ms() + self.ttl_ms;
        self.records.write().insert(member.node_id.clone(), (member.clone(), deadline));
        Ok(())
    }

    async fn unregister(&self, node_id: &NodeId) -> Result<(), ClusterError> {
        self.records.write().remove(node_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Member>, ClusterError> {
        let now_ms = self.time.now_unix_ms();
        Ok(self
            .records
            .read()
            .values()
            .filter(|(_, deadline)| *deadline > now_ms)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn heartbeat(&self, node_id: &NodeId) -> Result<(), ClusterError> {
        let now_ms = self.time.now_unix_ms();
        let mut records = self.records.write();
        match records.get_mut(node_id) {
            Some((_, deadline)) => {
                *deadline = now_ms + self.ttl_ms;
                Ok(())
            }
            None => Err(ClusterError::Discovery {
                reason: format!("heartbeat for unregistered node {node_id}"),
            }),
        }
    }
}

/// Shared registry reached over HTTP.
///
/// The registry service exposes `PUT/DELETE /v1/members/{id}` and
/// `GET /v1/members`; a `PUT` with a registered ID doubles as the heartbeat.
pub struct HttpRegistryDiscovery {
    base_url: String,
    ttl_ms: u64,
    client: reqwest::Client,
    /// Remembered so heartbeats can re-PUT the full record.
    registered: RwLock<Option<Member>>,
}

impl HttpRegistryDiscovery {
    /// Create a client for the registry at `base_url`.
    pub fn new(base_url: impl Into<String>, ttl_ms: u64) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ttl_ms,
            client: reqwest::Client::new(),
            registered: RwLock::new(None),
        }
    }

    fn member_url(&self, node_id: &NodeId) -> String {
        format!("{}/v1/members/{node_id}", self.base_url)
    }

    async fn put_member(&self, member: &Member) -> Result<(), ClusterError> {
        let response = self
            .client
            .put(self.member_url(&member.node_id))
            .query(&[("ttl_ms", self.ttl_ms)])
            .json(member)
            .send()
            .await
            .map_err(|err| ClusterError::Discovery {
                reason: format!("registry put failed: {err}"),
            })?;
        if !response.status().is_success() {
            return Err(ClusterError::Discovery {
                reason: format!("registry put returned {}", response.status()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Discovery for HttpRegistryDiscovery {
    async fn register(&self, member: &Member) -> Result<(), ClusterError> {
        self.put_member(member).await?;
        *self.registered.write() = Some(member.clone());
        Ok(())
    }

    async fn unregister(&self, node_id: &NodeId) -> Result<(), ClusterError> {
        let response = self.client.delete(self.member_url(node_id)).send().await.map_err(|err| {
            ClusterError::Discovery {
                reason: format!("registry delete failed: {err}"),
            }
        })?;
        if !response.status().is_success() {
            return Err(ClusterError::Discovery {
                reason: format!("registry delete returned {}", response.status()),
            });
        }
        *self.registered.write() = None;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Member>, ClusterError> {
        let response = self
            .client
            .get(format!("{}/v1/members", self.base_url))
            .send()
            .await
            .map_err(|err| ClusterError::Discovery {
                reason: format!("registry scan failed: {err}"),
            })?;
        if !response.status().is_success() {
            return Err(ClusterError::Discovery {
                reason: format!("registry scan returned {}", response.status()),
            });
        }
        response.json().await.map_err(|err| ClusterError::Discovery {
            reason: format!("registry scan body invalid: {err}"),
        })
    }

    async fn heartbeat(&self, node_id: &NodeId) -> Result<(), ClusterError> {
        let member = self.registered.read().clone();
        match member {
            Some(member) if member.node_id == *node_id => self.put_member(&member).await,
            _ => Err(ClusterError::Discovery {
                reason: format!("heartbeat for unregistered node {node_id}"),
            }),
        }
    }
}

/// Long-lived heartbeat + reconciliation task.
///
/// Registers on startup (the caller treats a failure here as fatal), then
/// renews the TTL and re-scans the backend on each interval, folding any
/// newly discovered peers into the membership view.
pub struct DiscoveryHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Register and start heartbeating.
    pub async fn start(
        discovery: Arc<dyn Discovery>,
        membership: Arc<Membership>,
        heartbeat_interval_ms: u64,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self, ClusterError> {
        let local = membership.local_member().clone();
        discovery.register(&local).await?;
        let initial = discovery.list().await?;
        info!(peers = initial.len(), "initial discovery scan complete");
        membership.seed(initial, time.now_unix_ms());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let node_id = local.node_id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, we just registered.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = discovery.heartbeat(&node_id).await {
                            warn!(error = %err, "discovery heartbeat failed");
                        }
                        match discovery.list().await {
                            Ok(peers) => {
                                debug!(peers = peers.len(), "discovery rescan");
                                membership.seed(peers, time.now_unix_ms());
                            }
                            Err(err) => warn!(error = %err, "discovery rescan failed"),
                        }
                    }
                }
            }
        });

        Ok(Self { shutdown_tx, task })
    }

    /// Stop heartbeating and unregister.
    pub async fn shutdown(self, discovery: &dyn Discovery, node_id: &NodeId) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
        if let Err(err) = discovery.unregister(node_id).await {
            warn!(error = %err, "discovery unregister failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualTimeProvider;

    fn member(id: &str) -> Member {
        Member {
            node_id: NodeId::new(id),
            advertise_addr: "127.0.0.1".to_string(),
            rpc_port: 7070,
            gossip_port: 7071,
            joined_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn static_discovery_lists_compiled_peers() {
        let discovery = StaticDiscovery::from_entries(&[
            "a@127.0.0.1:7070:7071".to_string(),
            "b@127.0.0.1:7080:7081".to_string(),
        ])
        .unwrap();
        let peers = discovery.list().await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id.as_str(), "a");
    }

    #[tokio::test]
    async fn static_discovery_rejects_malformed_entries() {
        let result = StaticDiscovery::from_entries(&["broken".to_string()]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn memory_registry_expires_without_heartbeat() {
        let time = ManualTimeProvider::starting_at(0);
        let registry = MemoryRegistry::new(1_000, Arc::new(time.clone()));

        registry.register(&member("a")).await.unwrap();
        assert_eq!(registry.list().await.unwrap().len(), 1);

        time.set(999);
        registry.heartbeat(&NodeId::new("a")).await.unwrap();
        time.set(1_500);
        // Renewed at 999 → deadline 1999; still listed.
        assert_eq!(registry.list().await.unwrap().len(), 1);

        time.set(2_000);
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_registry_unregister_removes() {
        let time = ManualTimeProvider::starting_at(0);
        let registry = MemoryRegistry::new(1_000, Arc::new(time.clone()));
        registry.register(&member("a")).await.unwrap();
        registry.unregister(&NodeId::new("a")).await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
        assert!(registry.heartbeat(&NodeId::new("a")).await.is_err());
    }

    #[tokio::test]
    async fn handle_seeds_membership_from_scan() {
        let time: Arc<dyn TimeProvider> = Arc::new(ManualTimeProvider::starting_at(0));
        let registry = Arc::new(MemoryRegistry::new(60_000, time.clone()));
        registry.register(&member("existing")).await.unwrap();

        let membership = Arc::new(Membership::new(member("local"), 0));
        let handle = DiscoveryHandle::start(registry.clone(), membership.clone(), 10_000, time)
            .await
            .unwrap();

        assert_eq!(membership.alive_peers().len(), 1);
        assert_eq!(registry.list().await.unwrap().len(), 2);

        handle.shutdown(registry.as_ref(), &NodeId::new("local")).await;
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }
}
