//! Cluster fabric: discovery, membership, hash ring, and peer RPC.
//!
//! The fabric keeps a consistent peer view (gossip over UDP seeded by a
//! discovery backend), derives counter ownership from it (consistent-hash
//! ring over the alive set), and moves counter state between nodes (TCP peer
//! RPC). Peer RPC and gossip both reject traffic from addresses that map to
//! no known member.

pub mod discovery;
pub mod error;
pub mod gossip;
pub mod membership;
pub mod ring;
pub mod rpc;
pub mod types;

pub use discovery::Discovery;
pub use discovery::DiscoveryHandle;
pub use discovery::HttpRegistryDiscovery;
pub use discovery::MemoryRegistry;
pub use discovery::StaticDiscovery;
pub use error::ClusterError;
pub use gossip::GossipConfig;
pub use gossip::GossipService;
pub use gossip::GossipStats;
pub use membership::Membership;
pub use ring::HashRing;
pub use rpc::BroadcastExceededRequest;
pub use rpc::DedupeWindow;
pub use rpc::PeerClient;
pub use rpc::PushCounterRequest;
pub use rpc::PushCounterResponse;
pub use rpc::RpcHandler;
pub use rpc::RpcServer;
pub use types::Member;
pub use types::MemberDigest;
pub use types::MemberRecord;
pub use types::MemberState;
pub use types::NodeId;
