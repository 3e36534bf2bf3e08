//! Authorization seam.
//!
//! Real deployments authenticate root keys in the platform's auth service;
//! the limiter only needs the resulting workspace scope and permission bits.
//! [`StaticAuthorizer`] implements the capability from a configured
//! `token=workspace` map, which is all tests and single-node setups need.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Who the caller is and what they may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Workspace every namespace and override is scoped to.
    pub workspace_id: String,
    /// May auto-create namespaces on first use.
    pub can_create_namespace: bool,
    /// May administer overrides.
    pub can_manage_overrides: bool,
}

/// Authentication failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No usable `Authorization: Bearer` header.
    #[error("missing or malformed authorization header")]
    MissingCredentials,

    /// The presented root key is not recognized.
    #[error("root key not recognized")]
    UnknownKey,
}

/// Resolves a bearer token to an authorization context.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Authorize a bearer token.
    async fn authorize(&self, bearer_token: &str) -> Result<AuthContext, AuthError>;
}

/// Config-driven token map.
pub struct StaticAuthorizer {
    keys: HashMap<String, String>,
}

impl StaticAuthorizer {
    /// Parse `token=workspace_id` entries.
    pub fn from_entries(entries: &[String]) -> Self {
        let keys = entries
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(token, workspace)| (token.to_string(), workspace.to_string()))
            })
            .collect();
        Self { keys }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, bearer_token: &str) -> Result<AuthContext, AuthError> {
        match self.keys.get(bearer_token) {
            Some(workspace_id) => Ok(AuthContext {
                workspace_id: workspace_id.clone(),
                can_create_namespace: true,
                can_manage_overrides: true,
            }),
            None => Err(AuthError::UnknownKey),
        }
    }
}
