//! Cluster fabric error type.

use thiserror::Error;

use crate::cluster::types::NodeId;

/// Errors raised by discovery, gossip, and peer RPC.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Socket-level failure.
    #[error("cluster io error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer operation missed its deadline.
    #[error("{operation} to {peer} timed out after {timeout_ms}ms")]
    Timeout {
        /// The peer that did not answer in time.
        peer: NodeId,
        /// The operation that timed out.
        operation: &'static str,
        /// The deadline that was missed.
        timeout_ms: u64,
    },

    /// Traffic from an address that maps to no cluster member.
    #[error("rejected traffic from non-member address {addr}")]
    NotMember {
        /// The offending source address.
        addr: String,
    },

    /// A malformed or oversized frame.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// What was violated.
        reason: String,
    },

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// A peer answered with an error payload.
    #[error("peer {peer} failed: {reason}")]
    PeerFailed {
        /// The peer that reported the failure.
        peer: NodeId,
        /// The peer's error detail.
        reason: String,
    },

    /// The discovery backend failed.
    #[error("discovery failed: {reason}")]
    Discovery {
        /// What went wrong.
        reason: String,
    },
}
