//! Gossip membership over UDP.
//!
//! Each round the node picks a handful of random peers, probes them, and
//! exchanges compact `(node, incarnation, state)` digests. A missed probe
//! moves a peer to suspect; an unrefuted suspect becomes dead after the
//! grace window. Divergent digests trigger anti-entropy record transfers.
//!
//! Datagrams are versioned postcard envelopes. Traffic from addresses that
//! map to no known member is dropped, with one exception: a `Sync` carrying
//! full member records is accepted as a join introduction, since a joining
//! node is by definition not yet a member.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cluster::error::ClusterError;
use crate::cluster::membership::Membership;
use crate::cluster::types::MemberDigest;
use crate::cluster::types::MemberRecord;
use crate::cluster::types::MemberState;
use crate::cluster::types::NodeId;
use crate::config::ClusterConfig;
use crate::constants::GOSSIP_PROTOCOL_VERSION;
use crate::constants::MAX_GOSSIP_DATAGRAM_BYTES;
use crate::time::TimeProvider;

/// Timing knobs for the gossip protocol.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Interval between gossip rounds.
    pub probe_interval_ms: u64,
    /// Deadline for a probe acknowledgement.
    pub probe_timeout_ms: u64,
    /// Grace window before a suspect is declared dead.
    pub suspect_timeout_ms: u64,
    /// Peers contacted per round.
    pub fanout: usize,
}

impl From<&ClusterConfig> for GossipConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            probe_interval_ms: config.probe_interval_ms,
            probe_timeout_ms: config.probe_timeout_ms,
            suspect_timeout_ms: config.effective_suspect_timeout_ms(),
            fanout: config.gossip_fanout,
        }
    }
}

/// Gossip message payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Payload {
    /// Liveness probe.
    Ping { seq: u64 },
    /// Probe acknowledgement.
    Ack { seq: u64 },
    /// Compact state digest for anti-entropy detection.
    Digest { entries: Vec<MemberDigest> },
    /// Ask the peer for its full records (we detected we are behind).
    SyncRequest,
    /// Full member records; also serves as the join introduction.
    Sync { records: Vec<MemberRecord> },
    /// Graceful departure announcement.
    Leave,
}

/// Versioned wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: u8,
    from: NodeId,
    payload: Payload,
}

impl Envelope {
    fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        let bytes = postcard::to_stdvec(self)?;
        if bytes.len() > MAX_GOSSIP_DATAGRAM_BYTES {
            return Err(ClusterError::Protocol {
                reason: format!("gossip datagram too large: {} bytes", bytes.len()),
            });
        }
        Ok(bytes)
    }

    /// Decode, rejecting unknown future versions.
    fn decode(bytes: &[u8]) -> Option<Self> {
        let envelope: Self = postcard::from_bytes(bytes).ok()?;
        if envelope.version > GOSSIP_PROTOCOL_VERSION {
            return None;
        }
        Some(envelope)
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default)]
pub struct GossipStats {
    /// Datagrams sent.
    pub sent: u64,
    /// Datagrams received and accepted.
    pub received: u64,
    /// Datagrams dropped by the membership ACL.
    pub rejected: u64,
    /// Probes sent.
    pub probes_sent: u64,
    /// Probes that missed their deadline.
    pub probes_missed: u64,
    /// Full record transfers sent.
    pub syncs_sent: u64,
}

#[derive(Default)]
struct StatsCells {
    sent: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
    probes_sent: AtomicU64,
    probes_missed: AtomicU64,
    syncs_sent: AtomicU64,
}

struct PendingProbe {
    node_id: NodeId,
    sent_at_ms: u64,
}

struct GossipInner {
    membership: Arc<Membership>,
    socket: UdpSocket,
    config: GossipConfig,
    /// Gossip addresses used for the initial join when no peer is known.
    seeds: Vec<String>,
    pending: Mutex<HashMap<u64, PendingProbe>>,
    seq: AtomicU64,
    time: Arc<dyn TimeProvider>,
    stats: StatsCells,
}

/// Long-lived gossip task pair (receiver + ticker).
pub struct GossipService {
    inner: Arc<GossipInner>,
    shutdown_tx: watch::Sender<bool>,
    recv_task: JoinHandle<()>,
    tick_task: JoinHandle<()>,
}

impl GossipService {
    /// Bind the gossip socket and start the protocol tasks.
    pub async fn bind(
        bind_addr: &str,
        membership: Arc<Membership>,
        config: GossipConfig,
        seeds: Vec<String>,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self, ClusterError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        info!(addr = %socket.local_addr()?, "gossip listening");

        let inner = Arc::new(GossipInner {
            membership,
            socket,
            config,
            seeds,
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            time,
            stats: StatsCells::default(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let recv_task = tokio::spawn(Self::recv_loop(inner.clone(), shutdown_rx.clone()));
        let tick_task = tokio::spawn(Self::tick_loop(inner.clone(), shutdown_rx));

        Ok(Self {
            inner,
            shutdown_tx,
            recv_task,
            tick_task,
        })
    }

    /// The bound gossip address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ClusterError> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Snapshot of protocol counters.
    pub fn stats(&self) -> GossipStats {
        let cells = &self.inner.stats;
        GossipStats {
            sent: cells.sent.load(Ordering::Relaxed),
            received: cells.received.load(Ordering::Relaxed),
            rejected: cells.rejected.load(Ordering::Relaxed),
            probes_sent: cells.probes_sent.load(Ordering::Relaxed),
            probes_missed: cells.probes_missed.load(Ordering::Relaxed),
            syncs_sent: cells.syncs_sent.load(Ordering::Relaxed),
        }
    }

    /// Kill the tasks without announcing departure (crash simulation).
    #[cfg(test)]
    pub(crate) fn abort(self) {
        self.recv_task.abort();
        self.tick_task.abort();
    }

    /// Announce departure to every reachable peer, then stop both tasks.
    pub async fn shutdown(self) {
        for peer in self.inner.membership.gossip_peers() {
            Self::send_to(&self.inner, &peer.gossip_addr(), Payload::Leave).await;
        }
        let _ = self.shutdown_tx.send(true);
        let _ = self.recv_task.await;
        let _ = self.tick_task.await;
    }

    async fn recv_loop(inner: Arc<GossipInner>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_GOSSIP_DATAGRAM_BYTES];
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                received = inner.socket.recv_from(&mut buf) => {
                    let (len, src) = match received {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "gossip recv failed");
                            continue;
                        }
                    };
                    let Some(envelope) = Envelope::decode(&buf[..len]) else {
                        inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };

                    // Membership ACL; Sync introductions are the join path.
                    let is_member = inner.membership.is_member_ip(src.ip());
                    let is_introduction = matches!(envelope.payload, Payload::Sync { .. });
                    if !is_member && !is_introduction {
                        inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        debug!(src = %src, "dropped gossip from non-member");
                        continue;
                    }

                    inner.stats.received.fetch_add(1, Ordering::Relaxed);
                    Self::handle(&inner, envelope, src).await;
                }
            }
        }
    }

    async fn handle(inner: &Arc<GossipInner>, envelope: Envelope, src: std::net::SocketAddr) {
        let now_ms = inner.time.now_unix_ms();
        match envelope.payload {
            Payload::Ping { seq } => {
                inner.membership.touch_alive(&envelope.from, now_ms);
                Self::send_to(inner, &src.to_string(), Payload::Ack { seq }).await;
            }
            Payload::Ack { seq } => {
                let probe = inner.pending.lock().remove(&seq);
                if let Some(probe) = probe {
                    inner.membership.touch_alive(&probe.node_id, now_ms);
                }
            }
            Payload::Digest { entries } => {
                Self::handle_digest(inner, entries, src).await;
            }
            Payload::SyncRequest => {
                Self::send_records(inner, &src.to_string()).await;
            }
            Payload::Sync { records } => {
                for record in records {
                    inner.membership.merge_record(record, now_ms);
                }
            }
            Payload::Leave => {
                inner.membership.remove(&envelope.from, now_ms);
            }
        }
    }

    async fn handle_digest(inner: &Arc<GossipInner>, entries: Vec<MemberDigest>, src: std::net::SocketAddr) {
        let now_ms = inner.time.now_unix_ms();
        let ours: HashMap<NodeId, MemberDigest> =
            inner.membership.digests().into_iter().map(|d| (d.node_id.clone(), d)).collect();

        let mut they_are_behind = false;
        let mut we_are_behind = false;

        for theirs in &entries {
            // Suspicion of ourselves is refuted through the normal merge.
            if theirs.node_id == *inner.membership.local_node_id() && theirs.state != MemberState::Alive {
                let claim = MemberRecord {
                    member: inner.membership.local_member().clone(),
                    state: theirs.state,
                    incarnation: theirs.incarnation,
                    state_changed_at_ms: now_ms,
                };
                inner.membership.merge_record(claim, now_ms);
                they_are_behind = true;
                continue;
            }

            match ours.get(&theirs.node_id) {
                None => we_are_behind = true,
                Some(mine) => {
                    if theirs.incarnation > mine.incarnation
                        || (theirs.incarnation == mine.incarnation && theirs.state.supersedes(&mine.state))
                    {
                        we_are_behind = true;
                    } else if mine.incarnation > theirs.incarnation
                        || (mine.incarnation == theirs.incarnation && mine.state.supersedes(&theirs.state))
                    {
                        they_are_behind = true;
                    }
                }
            }
        }

        let known_to_them: std::collections::HashSet<&NodeId> = entries.iter().map(|d| &d.node_id).collect();
        if ours.keys().any(|id| !known_to_them.contains(id)) {
            they_are_behind = true;
        }

        let peer = src.to_string();
        if they_are_behind {
            Self::send_records(inner, &peer).await;
        }
        if we_are_behind {
            Self::send_to(inner, &peer, Payload::SyncRequest).await;
        }
    }

    async fn tick_loop(inner: Arc<GossipInner>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(inner.config.probe_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => Self::round(&inner).await,
            }
        }
    }

    async fn round(inner: &Arc<GossipInner>) {
        let now_ms = inner.time.now_unix_ms();

        // Expire outstanding probes.
        let missed: Vec<NodeId> = {
            let mut pending = inner.pending.lock();
            let expired: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| now_ms.saturating_sub(p.sent_at_ms) >= inner.config.probe_timeout_ms)
                .map(|(seq, _)| *seq)
                .collect();
            expired
                .into_iter()
                .filter_map(|seq| pending.remove(&seq))
                .map(|p| p.node_id)
                .collect()
        };
        for node_id in missed {
            inner.stats.probes_missed.fetch_add(1, Ordering::Relaxed);
            inner.membership.mark_suspect(&node_id, now_ms);
        }

        // Advance suspects past their grace window.
        for node_id in inner.membership.expired_suspects(now_ms, inner.config.suspect_timeout_ms) {
            inner.membership.mark_dead(&node_id, now_ms);
        }
        inner
            .membership
            .prune_dead(now_ms, inner.config.suspect_timeout_ms.saturating_mul(10));

        let peers = inner.membership.gossip_peers();
        if peers.is_empty() {
            Self::join_via_seeds(inner).await;
            return;
        }

        let targets: Vec<_> = {
            let mut rng = rand::thread_rng();
            peers.choose_multiple(&mut rng, inner.config.fanout.max(1)).cloned().collect()
        };
        let digests = inner.membership.digests();
        for target in targets {
            let seq = inner.seq.fetch_add(1, Ordering::Relaxed);
            inner.pending.lock().insert(seq, PendingProbe {
                node_id: target.node_id.clone(),
                sent_at_ms: now_ms,
            });
            inner.stats.probes_sent.fetch_add(1, Ordering::Relaxed);
            let addr = target.gossip_addr();
            Self::send_to(inner, &addr, Payload::Ping { seq }).await;
            Self::send_to(inner, &addr, Payload::Digest {
                entries: digests.clone(),
            })
            .await;
        }
    }

    /// Introduce ourselves to the configured seeds.
    async fn join_via_seeds(inner: &Arc<GossipInner>) {
        let own_record = MemberRecord::alive(
            inner.membership.local_member().clone(),
            inner.membership.incarnation(),
            inner.time.now_unix_ms(),
        );
        let own_addr = inner.membership.local_member().gossip_addr();
        for seed in &inner.seeds {
            if *seed == own_addr {
                continue;
            }
            Self::send_to(inner, seed, Payload::Sync {
                records: vec![own_record.clone()],
            })
            .await;
        }
    }

    async fn send_records(inner: &Arc<GossipInner>, addr: &str) {
        inner.stats.syncs_sent.fetch_add(1, Ordering::Relaxed);
        Self::send_to(inner, addr, Payload::Sync {
            records: inner.membership.records(),
        })
        .await;
    }

    async fn send_to(inner: &Arc<GossipInner>, addr: &str, payload: Payload) {
        let envelope = Envelope {
            version: GOSSIP_PROTOCOL_VERSION,
            from: inner.membership.local_node_id().clone(),
            payload,
        };
        match envelope.encode() {
            Ok(bytes) => {
                if let Err(err) = inner.socket.send_to(&bytes, addr).await {
                    debug!(addr, error = %err, "gossip send failed");
                } else {
                    inner.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => warn!(addr, error = %err, "gossip encode failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::Member;
    use crate::time::SystemTimeProvider;

    fn fast_config() -> GossipConfig {
        GossipConfig {
            probe_interval_ms: 25,
            probe_timeout_ms: 100,
            suspect_timeout_ms: 200,
            fanout: 3,
        }
    }

    async fn start_node(
        id: &str,
        seeds: Vec<String>,
    ) -> (Arc<Membership>, GossipService) {
        // Bind first so the advertised gossip port is real.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let gossip_port = probe.local_addr().unwrap().port();
        drop(probe);

        let member = Member {
            node_id: NodeId::new(id),
            advertise_addr: "127.0.0.1".to_string(),
            rpc_port: 0,
            gossip_port,
            joined_at_ms: 0,
        };
        let membership = Arc::new(Membership::new(member, 0));
        let service = GossipService::bind(
            &format!("127.0.0.1:{gossip_port}"),
            membership.clone(),
            fast_config(),
            seeds,
            Arc::new(SystemTimeProvider),
        )
        .await
        .unwrap();
        (membership, service)
    }

    #[tokio::test]
    async fn envelope_roundtrip_and_version_gate() {
        let envelope = Envelope {
            version: GOSSIP_PROTOCOL_VERSION,
            from: NodeId::new("a"),
            payload: Payload::Ping { seq: 7 },
        };
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert!(matches!(decoded.payload, Payload::Ping { seq: 7 }));

        let future = Envelope {
            version: GOSSIP_PROTOCOL_VERSION + 1,
            ..envelope
        };
        assert!(Envelope::decode(&future.encode().unwrap()).is_none());
    }

    #[tokio::test]
    async fn two_nodes_discover_each_other_via_seed() {
        let (membership_a, service_a) = start_node("node-a", Vec::new()).await;
        let seed = service_a.local_addr().unwrap().to_string();
        let (membership_b, service_b) = start_node("node-b", vec![seed]).await;

        // Wait for the join introduction and digest exchange to settle.
        for _ in 0..100 {
            if membership_a.alive_peers().len() == 1 && membership_b.alive_peers().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(membership_a.alive_peers().len(), 1, "a should learn b");
        assert_eq!(membership_b.alive_peers().len(), 1, "b should learn a");
        assert_eq!(membership_a.ring().len(), 2);
        assert_eq!(membership_b.ring().len(), 2);

        service_a.shutdown().await;
        service_b.shutdown().await;
    }

    #[tokio::test]
    async fn graceful_leave_removes_peer_immediately() {
        let (membership_a, service_a) = start_node("node-a", Vec::new()).await;
        let seed = service_a.local_addr().unwrap().to_string();
        let (membership_b, service_b) = start_node("node-b", vec![seed]).await;

        for _ in 0..100 {
            if membership_a.alive_peers().len() == 1 && membership_b.alive_peers().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(membership_a.ring().len(), 2);

        // b leaves gracefully: a drops it without waiting out suspicion.
        service_b.shutdown().await;
        for _ in 0..50 {
            if membership_a.member(&NodeId::new("node-b")).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(membership_a.member(&NodeId::new("node-b")).is_none());
        assert_eq!(membership_a.ring().len(), 1);
        drop(membership_b);

        service_a.shutdown().await;
    }

    #[tokio::test]
    async fn dead_peer_is_detected_and_removed_from_ring() {
        let (membership_a, service_a) = start_node("node-a", Vec::new()).await;
        let seed = service_a.local_addr().unwrap().to_string();
        let (membership_b, service_b) = start_node("node-b", vec![seed]).await;

        for _ in 0..100 {
            if membership_a.alive_peers().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(membership_a.ring().len(), 2);

        // Crash b without a leave announcement; a's probes start missing.
        service_b.abort();
        drop(membership_b);

        for _ in 0..200 {
            if membership_a.alive_peers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(membership_a.alive_peers().is_empty(), "b should be suspected then dead");
        assert_eq!(membership_a.ring().len(), 1);

        service_a.shutdown().await;
    }
}
