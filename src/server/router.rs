//! Public API router.
//!
//! One sub-router per API surface, composed with `Router::nest`:
//!
//! ```text
//! /
//! ├── /v1/ratelimit.*   - limit + override CRUD
//! └── /health           - liveness and coordinator counters
//! ```

use axum::Router;
use axum::middleware;
use axum::routing::get;
use axum::routing::post;

use crate::server::AppState;
use crate::server::handlers;
use crate::server::middleware::request_id;

/// Build the complete router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/v1", v1_router())
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// Rate-limit operations.
///
/// Routes:
/// - `POST /v1/ratelimit.limit` - decide one call
/// - `POST /v1/ratelimit.setOverride` - create or replace an override
/// - `POST /v1/ratelimit.getOverride` - fetch an override
/// - `POST /v1/ratelimit.listOverrides` - cursor-paginated listing
/// - `POST /v1/ratelimit.deleteOverride` - soft-delete an override
fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/ratelimit.limit", post(handlers::ratelimit_limit))
        .route("/ratelimit.setOverride", post(handlers::set_override))
        .route("/ratelimit.getOverride", post(handlers::get_override))
        .route("/ratelimit.listOverrides", post(handlers::list_overrides))
        .route("/ratelimit.deleteOverride", post(handlers::delete_override))
}
