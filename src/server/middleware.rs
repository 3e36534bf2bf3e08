//! Request-ID middleware.
//!
//! Every request gets a generated ID, available to handlers via an
//! extension and echoed back in the `x-request-id` response header so
//! callers can correlate error bodies with logs.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

/// Per-request correlation ID.
#[derive(Debug, Clone)]
pub struct RequestId(String);

impl RequestId {
    /// The ID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Header carrying the request ID on responses.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Attach a request ID to the request extensions and the response headers.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = format!("req_{}", uuid::Uuid::new_v4().simple());
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
