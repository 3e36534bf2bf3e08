//! Cluster member types and gossip states.

use serde::Deserialize;
use serde::Serialize;

/// Stable node identifier for the lifetime of a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap a raw ID string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw ID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A peer node as registered in discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable node ID.
    pub node_id: NodeId,
    /// Address other members use to reach this node.
    pub advertise_addr: String,
    /// TCP port for peer RPC.
    pub rpc_port: u16,
    /// UDP port for gossip.
    pub gossip_port: u16,
    /// When the node joined the cluster (Unix ms).
    pub joined_at_ms: u64,
}

impl Member {
    /// Socket address string for peer RPC.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.rpc_port)
    }

    /// Socket address string for gossip.
    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.gossip_port)
    }

    /// Parse a static-peer entry: `node_id@host:rpc_port:gossip_port`.
    pub fn parse_static(s: &str) -> Option<Self> {
        let (node_id, rest) = s.split_once('@')?;
        let mut parts = rest.rsplitn(3, ':');
        let gossip_port: u16 = parts.next()?.parse().ok()?;
        let rpc_port: u16 = parts.next()?.parse().ok()?;
        let host = parts.next()?;
        if node_id.is_empty() || host.is_empty() {
            return None;
        }
        Some(Self {
            node_id: NodeId::new(node_id),
            advertise_addr: host.to_string(),
            rpc_port,
            gossip_port,
            joined_at_ms: 0,
        })
    }
}

/// Gossip-visible liveness state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Responding to probes.
    Alive,
    /// Missed its probe deadline; grace window running.
    Suspect,
    /// Grace window elapsed without refutation.
    Dead,
}

impl MemberState {
    /// Precedence for merging conflicting reports at equal incarnation:
    /// worse information wins.
    fn rank(&self) -> u8 {
        match self {
            Self::Alive => 0,
            Self::Suspect => 1,
            Self::Dead => 2,
        }
    }

    /// Whether `self` overrides `other` at the same incarnation.
    pub fn supersedes(&self, other: &Self) -> bool {
        self.rank() > other.rank()
    }
}

/// Full gossip record for one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// The member's registration data.
    pub member: Member,
    /// Current liveness state.
    pub state: MemberState,
    /// Incarnation number; only the member itself increments it (to refute
    /// suspicion). A node is never reported alive at a lower incarnation
    /// than last seen.
    pub incarnation: u64,
    /// When the state last changed (Unix ms, local clock).
    pub state_changed_at_ms: u64,
}

impl MemberRecord {
    /// Fresh alive record.
    pub fn alive(member: Member, incarnation: u64, now_ms: u64) -> Self {
        Self {
            member,
            state: MemberState::Alive,
            incarnation,
            state_changed_at_ms: now_ms,
        }
    }

    /// Compact digest of this record.
    pub fn digest(&self) -> MemberDigest {
        MemberDigest {
            node_id: self.member.node_id.clone(),
            incarnation: self.incarnation,
            state: self.state,
        }
    }
}

/// Compact `(node, incarnation, state)` triple exchanged in gossip rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDigest {
    /// Node this digest describes.
    pub node_id: NodeId,
    /// Incarnation at the sender.
    pub incarnation: u64,
    /// State at the sender.
    pub state: MemberState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_static_roundtrip() {
        let member = Member::parse_static("alpha@10.1.2.3:7070:7071").unwrap();
        assert_eq!(member.node_id.as_str(), "alpha");
        assert_eq!(member.rpc_addr(), "10.1.2.3:7070");
        assert_eq!(member.gossip_addr(), "10.1.2.3:7071");
    }

    #[test]
    fn parse_static_rejects_malformed() {
        assert!(Member::parse_static("alpha@host:1").is_none());
        assert!(Member::parse_static("@host:1:2").is_none());
        assert!(Member::parse_static("alpha@:1:2").is_none());
        assert!(Member::parse_static("no-at-sign:1:2").is_none());
        assert!(Member::parse_static("alpha@host:x:2").is_none());
    }

    #[test]
    fn state_precedence() {
        assert!(MemberState::Suspect.supersedes(&MemberState::Alive));
        assert!(MemberState::Dead.supersedes(&MemberState::Suspect));
        assert!(!MemberState::Alive.supersedes(&MemberState::Dead));
    }
}
