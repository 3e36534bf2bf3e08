//! Consistent-hash ring over the alive member set.
//!
//! Each node occupies [`RING_VNODES`](crate::constants::RING_VNODES) virtual
//! positions on a 64-bit ring; the primary owner of a key is the first node
//! clockwise from the key's hash. The ring is immutable once built: every
//! membership change publishes a fresh ring, and in-flight requests keep the
//! snapshot they started with.
//!
//! Determinism matters more than hash quality here: for the same member set,
//! every node must compute an identical ring. All members run the same
//! build, so the standard library hasher is stable across the cluster.

use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;

use crate::cluster::types::NodeId;
use crate::constants::RING_VNODES;

/// Stable 64-bit hash of a key string.
fn stable_hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Immutable consistent-hash ring.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// `(position, node index)` sorted by position; node index points into
    /// `nodes`.
    points: Vec<(u64, u32)>,
    nodes: Vec<NodeId>,
}

impl HashRing {
    /// Build a ring from the current member set.
    ///
    /// The input is sorted and deduplicated first so every node computes an
    /// identical ring for the same membership.
    pub fn build(mut nodes: Vec<NodeId>) -> Self {
        nodes.sort();
        nodes.dedup();

        let mut points = Vec::with_capacity(nodes.len() * RING_VNODES as usize);
        for (index, node) in nodes.iter().enumerate() {
            for vnode in 0..RING_VNODES {
                points.push((stable_hash(&format!("{node}:{vnode}")), index as u32));
            }
        }
        // Position collisions across nodes are broken by node order, which is
        // itself deterministic after the sort above.
        points.sort_unstable();

        Self { points, nodes }
    }

    /// The primary owner of `key`, or `None` on an empty ring.
    pub fn owner(&self, key: &str) -> Option<&NodeId> {
        if self.points.is_empty() {
            return None;
        }
        let hash = stable_hash(key);
        let at = self.points.partition_point(|(position, _)| *position < hash);
        let (_, index) = self.points[at % self.points.len()];
        self.nodes.get(index as usize)
    }

    /// Nodes on the ring, sorted by ID.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of nodes on the ring.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
