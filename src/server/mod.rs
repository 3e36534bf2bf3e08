//! Public HTTP API.
//!
//! Serves the limit operation and override CRUD on the configured HTTP
//! port. Authentication is a seam ([`auth::Authorizer`]); the platform's
//! real middleware plugs in out of tree.

pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod router;

use std::sync::Arc;

use crate::overrides::admin::OverrideAdmin;
use crate::ratelimit::service::RatelimitService;

pub use auth::AuthContext;
pub use auth::AuthError;
pub use auth::Authorizer;
pub use auth::StaticAuthorizer;
pub use middleware::RequestId;
pub use router::build_router;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// The limiter coordinator.
    pub service: Arc<RatelimitService>,
    /// Override administration.
    pub admin: Arc<OverrideAdmin>,
    /// Authorization seam.
    pub authorizer: Arc<dyn Authorizer>,
    /// This node's ID, for health reporting.
    pub node_id: String,
}
