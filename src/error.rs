//! Public error taxonomy.
//!
//! Subsystems carry their own typed errors; this module defines the codes a
//! caller can observe and the JSON body every failed request carries. The
//! mapping to HTTP statuses lives with the server, keeping this module free
//! of transport concerns beyond the status hint.

use serde::Deserialize;
use serde::Serialize;

/// Base URL for error documentation pages.
pub const DOCS_BASE_URL: &str = "https://turnstile.dev/docs/errors";

/// Machine-readable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request payload or out-of-range parameters. Never retried.
    BadRequest,
    /// Missing or unparseable credentials. Never retried.
    Unauthorized,
    /// Credentials valid but insufficient permissions. Never retried.
    Forbidden,
    /// Namespace or override absent and the caller may not auto-create.
    NotFound,
    /// The owning node for a counter could not be reached in sync mode.
    OriginUnavailable,
    /// Invariant violation or arithmetic anomaly. Never retried.
    InternalServerError,
}

impl ErrorCode {
    /// Documentation slug for this code.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::OriginUnavailable => "origin_unavailable",
            Self::InternalServerError => "internal_server_error",
        }
    }

    /// HTTP status this code maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::OriginUnavailable => 503,
            Self::InternalServerError => 500,
        }
    }

    /// Full documentation URL for this code.
    pub fn docs_url(&self) -> String {
        format!("{}/{}", DOCS_BASE_URL, self.slug())
    }
}

/// Body returned on every failed request.
///
/// Success fields (`success`, `remaining`, `reset`) are never present on an
/// error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code from the taxonomy.
    pub code: ErrorCode,
    /// Human-readable detail safe to show the caller.
    pub message: String,
    /// Link to the documentation page for this code.
    pub docs_url: String,
    /// Request ID for correlating logs.
    pub request_id: String,
}

impl ErrorBody {
    /// Build a body for the given code and detail.
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            docs_url: code.docs_url(),
            request_id: request_id.into(),
        }
    }
}
