//! Peer RPC over TCP.
//!
//! Two RPCs cross node boundaries: `PushCounter` (non-owner sends its
//! accumulated delta to the owner) and `BroadcastExceeded` (owner tells
//! everyone a counter blew its limit). Frames are length-prefixed postcard;
//! connections from addresses that map to no live member are rejected.
//! Both RPCs are idempotent under retries; the handler keeps a dedupe
//! window of request IDs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cluster::error::ClusterError;
use crate::cluster::membership::Membership;
use crate::cluster::types::Member;
use crate::cluster::types::NodeId;
use crate::constants::MAX_RPC_FRAME_BYTES;
use crate::constants::RPC_CONNECT_TIMEOUT_MS;

/// Non-owner delta push to the counter's origin node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushCounterRequest {
    /// Unique ID for idempotent retries.
    pub request_id: String,
    /// Namespace the counter belongs to.
    pub namespace_id: String,
    /// Counter identifier (post edge-sharding).
    pub identifier: String,
    /// Locally admitted cost since the last push.
    pub delta: u64,
    /// Window the delta was admitted in.
    pub window_start_ms: u64,
    /// Limit parameter of the counter sequence.
    pub limit: u64,
    /// Duration parameter of the counter sequence.
    pub duration_ms: u64,
}

/// Owner's authoritative answer to a delta push.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushCounterResponse {
    /// Authoritative count in the current window.
    pub current: u64,
    /// Whether the authoritative count is within the limit.
    pub passed: bool,
    /// When the current window closes (Unix ms).
    pub reset_at_ms: u64,
}

/// Owner fan-out when a counter crosses its limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BroadcastExceededRequest {
    /// Namespace the counter belongs to.
    pub namespace_id: String,
    /// Counter identifier (post edge-sharding).
    pub identifier: String,
    /// Window in which the limit was crossed.
    pub window_start_ms: u64,
    /// Pin local counters to deny until this time.
    pub reset_at_ms: u64,
    /// Limit parameter of the counter sequence.
    pub limit: u64,
    /// Duration parameter of the counter sequence.
    pub duration_ms: u64,
}

/// Requests a peer can send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Delta push to the owner.
    PushCounter(PushCounterRequest),
    /// Exceeded fan-out from the owner.
    BroadcastExceeded(BroadcastExceededRequest),
}

/// Responses a peer can return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Answer to `PushCounter`.
    PushCounter(PushCounterResponse),
    /// Acknowledgement without a payload.
    Ack,
    /// The peer failed to serve the request.
    Error {
        /// Sanitized failure detail.
        message: String,
    },
}

/// Server-side dispatch for peer RPCs.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle a delta push as the owner.
    async fn push_counter(&self, request: PushCounterRequest) -> Result<PushCounterResponse, ClusterError>;

    /// Handle an exceeded broadcast as a recipient.
    async fn broadcast_exceeded(&self, request: BroadcastExceededRequest) -> Result<(), ClusterError>;
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), ClusterError> {
    if bytes.len() > MAX_RPC_FRAME_BYTES {
        return Err(ClusterError::Protocol {
            reason: format!("rpc frame too large: {} bytes", bytes.len()),
        });
    }
    stream.write_u32_le(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, ClusterError> {
    let len = stream.read_u32_le().await? as usize;
    if len > MAX_RPC_FRAME_BYTES {
        return Err(ClusterError::Protocol {
            reason: format!("rpc frame too large: {len} bytes"),
        });
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Accept loop serving peer RPCs.
pub struct RpcServer {
    local_addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl RpcServer {
    /// Bind and serve.
    pub async fn bind(
        bind_addr: &str,
        membership: Arc<Membership>,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<Self, ClusterError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "peer rpc listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(Self::accept_loop(listener, membership, handler, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }

    /// The bound RPC address.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_task.await;
    }

    async fn accept_loop(
        listener: TcpListener,
        membership: Arc<Membership>,
        handler: Arc<dyn RpcHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "rpc accept failed");
                            continue;
                        }
                    };
                    if !membership.is_member_ip(peer_addr.ip()) {
                        debug!(peer = %peer_addr, "rejected rpc connection from non-member");
                        continue;
                    }
                    let handler = handler.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(Self::serve_connection(stream, handler, conn_shutdown));
                }
            }
        }
    }

    async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn RpcHandler>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => return,
                frame = read_frame(&mut stream) => frame,
            };
            let bytes = match frame {
                Ok(bytes) => bytes,
                // Peer hung up or sent garbage; either way this conn is done.
                Err(_) => return,
            };
            let response = match postcard::from_bytes::<RpcRequest>(&bytes) {
                Ok(RpcRequest::PushCounter(request)) => match handler.push_counter(request).await {
                    Ok(response) => RpcResponse::PushCounter(response),
                    Err(err) => RpcResponse::Error {
                        message: err.to_string(),
                    },
                },
                Ok(RpcRequest::BroadcastExceeded(request)) => match handler.broadcast_exceeded(request).await {
                    Ok(()) => RpcResponse::Ack,
                    Err(err) => RpcResponse::Error {
                        message: err.to_string(),
                    },
                },
                Err(err) => RpcResponse::Error {
                    message: format!("malformed request: {err}"),
                },
            };
            let encoded = match postcard::to_stdvec(&response) {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!(error = %err, "rpc response encode failed");
                    return;
                }
            };
            if write_frame(&mut stream, &encoded).await.is_err() {
                return;
            }
        }
    }
}

/// Pooled client for calling peers.
///
/// One connection per peer, serialized per peer; a failed call drops the
/// pooled connection so the next call reconnects.
pub struct PeerClient {
    pool: dashmap::DashMap<NodeId, Arc<AsyncMutex<Option<TcpStream>>>>,
    rpc_timeout_ms: u64,
}

impl PeerClient {
    /// Create a client with the given per-call deadline.
    pub fn new(rpc_timeout_ms: u64) -> Self {
        Self {
            pool: dashmap::DashMap::new(),
            rpc_timeout_ms,
        }
    }

    /// Push a counter delta to `member`.
    pub async fn push_counter(&self, member: &Member, request: PushCounterRequest) -> Result<PushCounterResponse, ClusterError> {
        match self.call(member, &RpcRequest::PushCounter(request), "push_counter").await? {
            RpcResponse::PushCounter(response) => Ok(response),
            RpcResponse::Error { message } => Err(ClusterError::PeerFailed {
                peer: member.node_id.clone(),
                reason: message,
            }),
            RpcResponse::Ack => Err(ClusterError::Protocol {
                reason: "unexpected ack for push_counter".to_string(),
            }),
        }
    }

    /// Fan an exceeded notification out to `member`.
    pub async fn broadcast_exceeded(&self, member: &Member, request: BroadcastExceededRequest) -> Result<(), ClusterError> {
        match self.call(member, &RpcRequest::BroadcastExceeded(request), "broadcast_exceeded").await? {
            RpcResponse::Ack => Ok(()),
            RpcResponse::Error { message } => Err(ClusterError::PeerFailed {
                peer: member.node_id.clone(),
                reason: message,
            }),
            RpcResponse::PushCounter(_) => Err(ClusterError::Protocol {
                reason: "unexpected payload for broadcast_exceeded".to_string(),
            }),
        }
    }

    /// Drop the pooled connection for a peer (e.g. after it left the ring).
    pub fn forget(&self, node_id: &NodeId) {
        self.pool.remove(node_id);
    }

    async fn call(&self, member: &Member, request: &RpcRequest, operation: &'static str) -> Result<RpcResponse, ClusterError> {
        let slot = self
            .pool
            .entry(member.node_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone();
        let mut guard = slot.lock().await;

        let deadline = Duration::from_millis(self.rpc_timeout_ms);
        let result = tokio::time::timeout(deadline, Self::call_on(&mut guard, member, request)).await;
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                *guard = None;
                Err(err)
            }
            Err(_) => {
                *guard = None;
                Err(ClusterError::Timeout {
                    peer: member.node_id.clone(),
                    operation,
                    timeout_ms: self.rpc_timeout_ms,
                })
            }
        }
    }

    async fn call_on(
        slot: &mut Option<TcpStream>,
        member: &Member,
        request: &RpcRequest,
    ) -> Result<RpcResponse, ClusterError> {
        if slot.is_none() {
            let connect = TcpStream::connect(member.rpc_addr());
            let stream = tokio::time::timeout(Duration::from_millis(RPC_CONNECT_TIMEOUT_MS), connect)
                .await
                .map_err(|_| ClusterError::Timeout {
                    peer: member.node_id.clone(),
                    operation: "connect",
                    timeout_ms: RPC_CONNECT_TIMEOUT_MS,
                })??;
            stream.set_nodelay(true)?;
            *slot = Some(stream);
        }
        // Checked just above; the borrow is only split for the connect.
        let stream = slot.as_mut().ok_or_else(|| ClusterError::Protocol {
            reason: "connection slot empty after connect".to_string(),
        })?;

        let bytes = postcard::to_stdvec(request)?;
        write_frame(stream, &bytes).await?;
        let response = read_frame(stream).await?;
        Ok(postcard::from_bytes(&response)?)
    }
}

/// Request-ID dedupe window for idempotent RPC retries.
///
/// The owner remembers each `PushCounter` request ID together with its
/// response for twice the counter's window; a replay returns the remembered
/// response without touching the count.
pub struct DedupeWindow {
    entries: parking_lot::Mutex<HashMap<String, (PushCounterResponse, u64)>>,
}

impl Default for DedupeWindow {
    fn default() -> Self {
        Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

impl DedupeWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a remembered response.
    pub fn get(&self, request_id: &str, now_ms: u64) -> Option<PushCounterResponse> {
        let entries = self.entries.lock();
        entries
            .get(request_id)
            .filter(|(_, expires_at)| *expires_at > now_ms)
            .map(|(response, _)| *response)
    }

    /// Remember a response until `expires_at_ms`, sweeping stale entries.
    pub fn insert(&self, request_id: String, response: PushCounterResponse, expires_at_ms: u64, now_ms: u64) {
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, expires_at)| *expires_at > now_ms);
        entries.insert(request_id, (response, expires_at_ms));
    }

    /// Number of remembered request IDs.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::MemberState;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn push_counter(&self, request: PushCounterRequest) -> Result<PushCounterResponse, ClusterError> {
            Ok(PushCounterResponse {
                current: request.delta,
                passed: true,
                reset_at_ms: request.window_start_ms + request.duration_ms,
            })
        }

        async fn broadcast_exceeded(&self, _request: BroadcastExceededRequest) -> Result<(), ClusterError> {
            Ok(())
        }
    }

    fn local_member(id: &str, rpc_port: u16) -> Member {
        Member {
            node_id: NodeId::new(id),
            advertise_addr: "127.0.0.1".to_string(),
            rpc_port,
            gossip_port: 0,
            joined_at_ms: 0,
        }
    }

    fn push_request(delta: u64) -> PushCounterRequest {
        PushCounterRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            namespace_id: "ns".to_string(),
            identifier: "id".to_string(),
            delta,
            window_start_ms: 0,
            limit: 10,
            duration_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn rpc_roundtrip() {
        let membership = Arc::new(Membership::new(local_member("server", 0), 0));
        let server = RpcServer::bind("127.0.0.1:0", membership.clone(), Arc::new(EchoHandler)).await.unwrap();
        let target = local_member("server", server.local_addr().port());

        let client = PeerClient::new(1_000);
        let response = client.push_counter(&target, push_request(4)).await.unwrap();
        assert_eq!(response.current, 4);
        assert!(response.passed);

        client
            .broadcast_exceeded(&target, BroadcastExceededRequest {
                namespace_id: "ns".to_string(),
                identifier: "id".to_string(),
                window_start_ms: 0,
                reset_at_ms: 1_000,
                limit: 10,
                duration_ms: 1_000,
            })
            .await
            .unwrap();

        server.shutdown().await;
    }

    #[tokio::test]
    async fn connection_is_reused_across_calls() {
        let membership = Arc::new(Membership::new(local_member("server", 0), 0));
        let server = RpcServer::bind("127.0.0.1:0", membership, Arc::new(EchoHandler)).await.unwrap();
        let target = local_member("server", server.local_addr().port());

        let client = PeerClient::new(1_000);
        for delta in 1..=5 {
            let response = client.push_counter(&target, push_request(delta)).await.unwrap();
            assert_eq!(response.current, delta);
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn non_member_connection_is_rejected() {
        // The server's membership knows only a non-loopback address, so our
        // 127.0.0.1 connection fails the ACL and is dropped without a reply.
        let membership = Membership::new(
            Member {
                node_id: NodeId::new("server"),
                advertise_addr: "10.99.99.99".to_string(),
                rpc_port: 0,
                gossip_port: 0,
                joined_at_ms: 0,
            },
            0,
        );
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(membership), Arc::new(EchoHandler)).await.unwrap();
        let target = local_member("server", server.local_addr().port());

        let client = PeerClient::new(200);
        let err = client.push_counter(&target, push_request(1)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { .. } | ClusterError::Io(_)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_peer_times_out() {
        let client = PeerClient::new(100);
        // RFC 5737 TEST-NET address; nothing listens there.
        let target = Member {
            node_id: NodeId::new("ghost"),
            advertise_addr: "192.0.2.1".to_string(),
            rpc_port: 9,
            gossip_port: 0,
            joined_at_ms: 0,
        };
        let err = client.push_counter(&target, push_request(1)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { .. } | ClusterError::Io(_)));
    }

    #[tokio::test]
    async fn dedupe_window_remembers_and_expires() {
        let window = DedupeWindow::new();
        let response = PushCounterResponse {
            current: 3,
            passed: true,
            reset_at_ms: 1_000,
        };
        window.insert("req-1".to_string(), response, 2_000, 0);
        assert_eq!(window.get("req-1", 1_999), Some(response));
        assert_eq!(window.get("req-1", 2_000), None);
        assert_eq!(window.get("other", 0), None);
    }

    #[test]
    fn member_state_is_wire_stable() {
        // The digest wire format must not change shape silently.
        let bytes = postcard::to_stdvec(&MemberState::Suspect).unwrap();
        let state: MemberState = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(state, MemberState::Suspect);
    }
}
