//! Shared membership view.
//!
//! One instance per process. Gossip, discovery, and the failure detector all
//! funnel their observations through here; every effective change republishes
//! the hash ring atomically and bumps a watchable version so long-lived tasks
//! can react. In-flight requests keep whatever ring snapshot they already
//! took.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cluster::ring::HashRing;
use crate::cluster::types::Member;
use crate::cluster::types::MemberDigest;
use crate::cluster::types::MemberRecord;
use crate::cluster::types::MemberState;
use crate::cluster::types::NodeId;
use crate::constants::MAX_CLUSTER_MEMBERS;

/// Process-wide member table and ring publisher.
pub struct Membership {
    local: Member,
    incarnation: AtomicU64,
    records: RwLock<HashMap<NodeId, MemberRecord>>,
    ring: RwLock<Arc<HashRing>>,
    version_tx: watch::Sender<u64>,
    version: AtomicU64,
}

impl Membership {
    /// Create a membership view containing only the local node.
    pub fn new(local: Member, now_ms: u64) -> Self {
        let mut records = HashMap::new();
        records.insert(local.node_id.clone(), MemberRecord::alive(local.clone(), 0, now_ms));
        let ring = Arc::new(HashRing::build(vec![local.node_id.clone()]));
        let (version_tx, _) = watch::channel(0);
        Self {
            local,
            incarnation: AtomicU64::new(0),
            records: RwLock::new(records),
            ring: RwLock::new(ring),
            version_tx,
            version: AtomicU64::new(0),
        }
    }

    /// This node's ID.
    pub fn local_node_id(&self) -> &NodeId {
        &self.local.node_id
    }

    /// This node's registration record.
    pub fn local_member(&self) -> &Member {
        &self.local
    }

    /// This node's current incarnation.
    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Current ring snapshot. Immutable; safe to hold across awaits.
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.read().clone()
    }

    /// Subscribe to membership version bumps.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// All records, including the local node.
    pub fn records(&self) -> Vec<MemberRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Digests for a gossip round.
    pub fn digests(&self) -> Vec<MemberDigest> {
        self.records.read().values().map(MemberRecord::digest).collect()
    }

    /// Alive members, including the local node.
    pub fn alive_members(&self) -> Vec<Member> {
        self.records
            .read()
            .values()
            .filter(|r| r.state == MemberState::Alive)
            .map(|r| r.member.clone())
            .collect()
    }

    /// Alive members other than the local node.
    pub fn alive_peers(&self) -> Vec<Member> {
        self.alive_members()
            .into_iter()
            .filter(|m| m.node_id != self.local.node_id)
            .collect()
    }

    /// Non-dead members other than the local node (gossip targets).
    pub fn gossip_peers(&self) -> Vec<Member> {
        self.records
            .read()
            .values()
            .filter(|r| r.state != MemberState::Dead && r.member.node_id != self.local.node_id)
            .map(|r| r.member.clone())
            .collect()
    }

    /// Look up a member's registration by ID.
    pub fn member(&self, node_id: &NodeId) -> Option<Member> {
        self.records.read().get(node_id).map(|r| r.member.clone())
    }

    /// Membership-based ACL: does `ip` belong to a known, non-dead member?
    pub fn is_member_ip(&self, ip: IpAddr) -> bool {
        self.records.read().values().any(|r| {
            r.state != MemberState::Dead
                && r.member.advertise_addr.parse::<IpAddr>().map(|member_ip| member_ip == ip).unwrap_or(false)
        })
    }

    /// Seed records learned from discovery; never downgrades existing state.
    pub fn seed(&self, members: Vec<Member>, now_ms: u64) {
        let mut changed = false;
        {
            let mut records = self.records.write();
            for member in members {
                if member.node_id == self.local.node_id {
                    continue;
                }
                if records.len() >= MAX_CLUSTER_MEMBERS && !records.contains_key(&member.node_id) {
                    warn!(node = %member.node_id, "member table full, ignoring discovered peer");
                    continue;
                }
                records.entry(member.node_id.clone()).or_insert_with(|| {
                    changed = true;
                    MemberRecord::alive(member, 0, now_ms)
                });
            }
        }
        if changed {
            self.publish();
        }
    }

    /// Merge a remote record under SWIM precedence.
    ///
    /// Higher incarnation wins outright; at equal incarnation the worse
    /// state wins. Remote claims about the local node that are not `Alive`
    /// are refuted by bumping our own incarnation past theirs.
    pub fn merge_record(&self, record: MemberRecord, now_ms: u64) -> bool {
        if record.member.node_id == self.local.node_id {
            return self.maybe_refute(&record, now_ms);
        }

        let mut changed = false;
        {
            let mut records = self.records.write();
            match records.get_mut(&record.member.node_id) {
                Some(existing) => {
                    let newer = record.incarnation > existing.incarnation
                        || (record.incarnation == existing.incarnation && record.state.supersedes(&existing.state));
                    if newer {
                        let state_changed = existing.state != record.state;
                        existing.incarnation = record.incarnation;
                        existing.state = record.state;
                        existing.member = record.member.clone();
                        if state_changed {
                            existing.state_changed_at_ms = now_ms;
                        }
                        changed = state_changed;
                    }
                }
                None => {
                    if records.len() >= MAX_CLUSTER_MEMBERS {
                        warn!(node = %record.member.node_id, "member table full, ignoring gossiped peer");
                    } else {
                        info!(node = %record.member.node_id, state = ?record.state, "learned member via gossip");
                        records.insert(record.member.node_id.clone(), MemberRecord {
                            state_changed_at_ms: now_ms,
                            ..record
                        });
                        changed = true;
                    }
                }
            }
        }
        if changed {
            self.publish();
        }
        changed
    }

    fn maybe_refute(&self, record: &MemberRecord, now_ms: u64) -> bool {
        if record.state == MemberState::Alive {
            return false;
        }
        let ours = self.incarnation.load(Ordering::SeqCst);
        if record.incarnation < ours {
            return false;
        }
        let next = record.incarnation + 1;
        self.incarnation.store(next, Ordering::SeqCst);
        {
            let mut records = self.records.write();
            if let Some(own) = records.get_mut(&self.local.node_id) {
                own.incarnation = next;
                own.state = MemberState::Alive;
                own.state_changed_at_ms = now_ms;
            }
        }
        info!(incarnation = next, "refuted remote suspicion of local node");
        self.publish();
        true
    }

    /// Failure detector: a probe missed its deadline.
    pub fn mark_suspect(&self, node_id: &NodeId, now_ms: u64) {
        self.transition(node_id, MemberState::Alive, MemberState::Suspect, now_ms);
    }

    /// Failure detector: the suspect grace window elapsed.
    pub fn mark_dead(&self, node_id: &NodeId, now_ms: u64) {
        self.transition(node_id, MemberState::Suspect, MemberState::Dead, now_ms);
    }

    /// A probe answered: clear local suspicion without touching incarnation.
    pub fn touch_alive(&self, node_id: &NodeId, now_ms: u64) {
        self.transition(node_id, MemberState::Suspect, MemberState::Alive, now_ms);
    }

    fn transition(&self, node_id: &NodeId, from: MemberState, to: MemberState, now_ms: u64) {
        if node_id == &self.local.node_id {
            return;
        }
        let mut changed = false;
        {
            let mut records = self.records.write();
            if let Some(record) = records.get_mut(node_id) {
                if record.state == from {
                    record.state = to;
                    record.state_changed_at_ms = now_ms;
                    changed = true;
                }
            }
        }
        if changed {
            debug!(node = %node_id, state = ?to, "member state transition");
            self.publish();
        }
    }

    /// Suspects whose grace window has elapsed.
    pub fn expired_suspects(&self, now_ms: u64, grace_ms: u64) -> Vec<NodeId> {
        self.records
            .read()
            .values()
            .filter(|r| r.state == MemberState::Suspect && now_ms.saturating_sub(r.state_changed_at_ms) >= grace_ms)
            .map(|r| r.member.node_id.clone())
            .collect()
    }

    /// Drop members that have been dead for longer than `retention_ms`.
    ///
    /// Dead records are retained for a while so stale gossip cannot
    /// resurrect a departed node.
    pub fn prune_dead(&self, now_ms: u64, retention_ms: u64) {
        let mut changed = false;
        {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|_, r| {
                r.state != MemberState::Dead || now_ms.saturating_sub(r.state_changed_at_ms) < retention_ms
            });
            changed = records.len() != before;
        }
        if changed {
            self.publish();
        }
    }

    /// Remove a member immediately (graceful shutdown announcement).
    pub fn remove(&self, node_id: &NodeId, now_ms: u64) {
        if node_id == &self.local.node_id {
            return;
        }
        let removed = self.records.write().remove(node_id).is_some();
        if removed {
            info!(node = %node_id, at_ms = now_ms, "member removed");
            self.publish();
        }
    }

    /// Rebuild the ring from the alive set and bump the version.
    fn publish(&self) {
        let alive: Vec<NodeId> = self
            .records
            .read()
            .values()
            .filter(|r| r.state == MemberState::Alive)
            .map(|r| r.member.node_id.clone())
            .collect();
        let ring = Arc::new(HashRing::build(alive));
        *self.ring.write() = ring;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.version_tx.send(version);
    }
}
