//! Shared discovery registry service.
//!
//! A small HTTP service that nodes in registry discovery mode register
//! against. Records carry a TTL renewed by heartbeat re-PUTs; expired
//! records drop out of scans. One registry (or a replicated set behind a
//! load balancer) serves a whole cluster; nodes point
//! `TURNSTILE_REGISTRY_URL` at it.
//!
//! Routes:
//! - `PUT    /v1/members/{id}?ttl_ms=N` - register or heartbeat a member
//! - `DELETE /v1/members/{id}` - withdraw a member (graceful shutdown)
//! - `GET    /v1/members` - scan live members

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::put;
use serde::Deserialize;
use tracing::debug;
use tracing::info;

use crate::cluster::discovery::Discovery;
use crate::cluster::discovery::MemoryRegistry;
use crate::cluster::types::Member;
use crate::cluster::types::NodeId;
use crate::constants::DEFAULT_REGISTRY_TTL_MS;
use crate::time::TimeProvider;

/// Shared state behind the registry routes.
#[derive(Clone)]
pub struct RegistryState {
    registry: Arc<MemoryRegistry>,
}

impl RegistryState {
    /// Create registry state with the given default TTL.
    pub fn new(default_ttl_ms: u64, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            registry: Arc::new(MemoryRegistry::new(default_ttl_ms, time)),
        }
    }

    /// The backing record table (for embedding in tests).
    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }
}

/// Build the registry router.
pub fn build_registry_router(state: RegistryState) -> Router {
    Router::new()
        .route("/v1/members", get(list_members))
        .route("/v1/members/{id}", put(put_member).delete(delete_member))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PutMemberQuery {
    #[serde(default)]
    ttl_ms: Option<u64>,
}

async fn put_member(
    State(state): State<RegistryState>,
    Path(id): Path<String>,
    Query(query): Query<PutMemberQuery>,
    body: Json<Member>,
) -> Response {
    let Json(member) = body;
    if member.node_id != NodeId::new(id.as_str()) {
        return (StatusCode::BAD_REQUEST, "path and body node IDs differ").into_response();
    }
    let ttl_ms = query.ttl_ms.unwrap_or(DEFAULT_REGISTRY_TTL_MS);
    state.registry.register_with_ttl(&member, ttl_ms);
    debug!(node = %member.node_id, ttl_ms, "registry record refreshed");
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_member(State(state): State<RegistryState>, Path(id): Path<String>) -> Response {
    let node_id = NodeId::new(id);
    // Discovery::unregister on the memory backend is infallible.
    let _ = state.registry.unregister(&node_id).await;
    info!(node = %node_id, "registry record withdrawn");
    StatusCode::NO_CONTENT.into_response()
}

async fn list_members(State(state): State<RegistryState>) -> Response {
    state.registry.sweep();
    match state.registry.list().await {
        Ok(members) => (StatusCode::OK, Json(members)).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
