//! HTTP handlers for the limit and override CRUD operations.
//!
//! Wire formats follow the public API contract exactly: the limit response
//! carries `success`/`limit`/`remaining`/`reset`/`overrideId`, and every
//! error response carries `{code, message, docs_url, request_id}` with a
//! status from the taxonomy. Validation failures never reach the service.

use axum::Json;
use axum::extract::Extension;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Deserialize;
use serde::Serialize;
use tracing::error;

use crate::constants::DEFAULT_COST;
use crate::constants::DEFAULT_LIMIT_DEADLINE_MS;
use crate::constants::DEFAULT_OVERRIDE_PAGE_SIZE;
use crate::constants::MAX_DURATION_MS;
use crate::constants::MAX_IDENTIFIER_LEN;
use crate::constants::MAX_NAMESPACE_LEN;
use crate::constants::MAX_OVERRIDE_PAGE_SIZE;
use crate::constants::MIN_DURATION_MS;
use crate::error::ErrorBody;
use crate::error::ErrorCode;
use crate::overrides::admin::AdminError;
use crate::overrides::admin::NamespaceSelector;
use crate::overrides::admin::OverrideParams;
use crate::overrides::resolver::ResolveError;
use crate::overrides::types::RatelimitOverride;
use crate::overrides::types::Sharding;
use crate::ratelimit::types::RatelimitError;
use crate::ratelimit::types::RatelimitRequest;
use crate::server::auth::AuthContext;
use crate::server::auth::AuthError;
use crate::server::middleware::RequestId;
use crate::server::AppState;

fn default_cost() -> u64 {
    DEFAULT_COST
}

/// `POST /v1/ratelimit.limit` request body.
#[derive(Debug, Deserialize)]
pub struct LimitBody {
    namespace: String,
    identifier: String,
    limit: u64,
    /// Window duration in milliseconds.
    duration: u64,
    #[serde(default = "default_cost")]
    cost: u64,
    #[serde(default, rename = "async")]
    async_mode: bool,
}

/// `POST /v1/ratelimit.limit` response body.
#[derive(Debug, Serialize)]
pub struct LimitResponseBody {
    success: bool,
    limit: u64,
    remaining: u64,
    /// Window reset time, Unix milliseconds.
    reset: u64,
    /// Winning override ID, empty string when none matched.
    #[serde(rename = "overrideId")]
    override_id: String,
}

/// Typed handler failure carrying the taxonomy code.
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Render with the request ID attached.
    fn into_response(self, request_id: &RequestId) -> Response {
        let status = StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody::new(self.code, self.message, request_id.as_str());
        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::new(ErrorCode::Unauthorized, err.to_string())
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NamespaceNotFound { .. } => Self::new(ErrorCode::NotFound, err.to_string()),
            ResolveError::Store(_) => {
                error!(error = %err, "policy resolution failed");
                Self::new(ErrorCode::InternalServerError, "policy resolution failed")
            }
        }
    }
}

impl From<RatelimitError> for ApiError {
    fn from(err: RatelimitError) -> Self {
        match err {
            RatelimitError::Resolve(inner) => inner.into(),
            RatelimitError::OriginUnavailable { .. } | RatelimitError::DeadlineExceeded { .. } => {
                Self::new(ErrorCode::OriginUnavailable, err.to_string())
            }
            RatelimitError::Internal { .. } => {
                error!(error = %err, "internal limiter failure");
                Self::new(ErrorCode::InternalServerError, "internal limiter failure")
            }
        }
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::NamespaceNotFound { .. } | AdminError::OverrideNotFound { .. } => {
                Self::new(ErrorCode::NotFound, err.to_string())
            }
            AdminError::Store(_) => {
                error!(error = %err, "override administration failed");
                Self::new(ErrorCode::InternalServerError, "override administration failed")
            }
        }
    }
}

/// Pull the bearer token and authorize it.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingCredentials)?;
    Ok(state.authorizer.authorize(token).await?)
}

/// Unwrap the JSON extractor's rejection into a taxonomy error.
fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
    }
}

fn validate_limit_body(body: &LimitBody) -> Result<(), ApiError> {
    if body.namespace.is_empty() || body.namespace.len() > MAX_NAMESPACE_LEN {
        return Err(ApiError::bad_request(format!(
            "namespace must be 1..{MAX_NAMESPACE_LEN} bytes"
        )));
    }
    if body.identifier.is_empty() || body.identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(ApiError::bad_request(format!(
            "identifier must be 1..{MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if body.limit == 0 {
        return Err(ApiError::bad_request("limit must be at least 1"));
    }
    if body.duration < MIN_DURATION_MS || body.duration > MAX_DURATION_MS {
        return Err(ApiError::bad_request(format!(
            "duration must be within {MIN_DURATION_MS}..{MAX_DURATION_MS} ms"
        )));
    }
    Ok(())
}

/// `POST /v1/ratelimit.limit`
pub async fn ratelimit_limit(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Result<Json<LimitBody>, JsonRejection>,
) -> Response {
    match limit_inner(&state, &headers, body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(&request_id),
    }
}

async fn limit_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Result<Json<LimitBody>, JsonRejection>,
) -> Result<LimitResponseBody, ApiError> {
    let body = parse_body(body)?;
    validate_limit_body(&body)?;
    let ctx = authorize(state, headers).await?;

    let request = RatelimitRequest {
        workspace_id: ctx.workspace_id,
        namespace: body.namespace,
        identifier: body.identifier,
        limit: body.limit,
        duration_ms: body.duration,
        cost: body.cost,
        async_mode: body.async_mode,
    };
    let decision = state
        .service
        .limit_with_deadline(
            &request,
            ctx.can_create_namespace,
            std::time::Duration::from_millis(DEFAULT_LIMIT_DEADLINE_MS),
        )
        .await?;

    Ok(LimitResponseBody {
        success: decision.success,
        limit: decision.limit,
        remaining: decision.remaining,
        reset: decision.reset_at_ms,
        override_id: decision.override_id.unwrap_or_default(),
    })
}

// ============================================================================
// Override CRUD
// ============================================================================

/// Namespace addressing shared by the override operations.
#[derive(Debug, Deserialize)]
struct NamespaceRef {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default, rename = "namespaceId")]
    namespace_id: Option<String>,
}

impl NamespaceRef {
    fn selector(&self) -> Result<NamespaceSelector, ApiError> {
        match (&self.namespace_id, &self.namespace) {
            (Some(id), _) if !id.is_empty() => Ok(NamespaceSelector::Id(id.clone())),
            (_, Some(name)) if !name.is_empty() => Ok(NamespaceSelector::Name(name.clone())),
            _ => Err(ApiError::bad_request("namespace or namespaceId is required")),
        }
    }
}

fn validate_identifier(identifier: &str) -> Result<(), ApiError> {
    if identifier.is_empty() || identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(ApiError::bad_request(format!(
            "identifier must be 1..{MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    Ok(())
}

/// Wire shape of a stored override.
#[derive(Debug, Serialize)]
pub struct OverrideBody {
    #[serde(rename = "overrideId")]
    override_id: String,
    #[serde(rename = "namespaceId")]
    namespace_id: String,
    identifier: String,
    limit: u64,
    duration: u64,
    #[serde(rename = "async")]
    async_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    sharding: Option<&'static str>,
}

impl From<RatelimitOverride> for OverrideBody {
    fn from(ov: RatelimitOverride) -> Self {
        Self {
            override_id: ov.id,
            namespace_id: ov.namespace_id,
            identifier: ov.identifier,
            limit: ov.limit,
            duration: ov.duration_ms,
            async_mode: ov.async_mode,
            sharding: ov.sharding.map(|s| s.as_str()),
        }
    }
}

/// `POST /v1/ratelimit.setOverride` request body.
#[derive(Debug, Deserialize)]
pub struct SetOverrideBody {
    #[serde(flatten)]
    namespace: NamespaceRef,
    identifier: String,
    limit: u64,
    duration: u64,
    #[serde(default, rename = "async")]
    async_mode: bool,
    #[serde(default)]
    sharding: Option<String>,
}

/// `POST /v1/ratelimit.setOverride`
pub async fn set_override(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Result<Json<SetOverrideBody>, JsonRejection>,
) -> Response {
    let result: Result<OverrideBody, ApiError> = async {
        let body = parse_body(body)?;
        validate_identifier(&body.identifier)?;
        if body.limit == 0 {
            return Err(ApiError::bad_request("limit must be at least 1"));
        }
        if body.duration < MIN_DURATION_MS || body.duration > MAX_DURATION_MS {
            return Err(ApiError::bad_request(format!(
                "duration must be within {MIN_DURATION_MS}..{MAX_DURATION_MS} ms"
            )));
        }
        let sharding = match body.sharding.as_deref() {
            None => None,
            Some(raw) => Some(
                Sharding::parse(raw).ok_or_else(|| ApiError::bad_request("sharding must be `edge` or `global`"))?,
            ),
        };
        let selector = body.namespace.selector()?;
        let ctx = authorize(&state, &headers).await?;
        if !ctx.can_manage_overrides {
            return Err(ApiError::new(ErrorCode::Forbidden, "missing permission to manage overrides"));
        }

        let stored = state
            .admin
            .set_override(
                &ctx.workspace_id,
                &selector,
                &body.identifier,
                OverrideParams {
                    limit: body.limit,
                    duration_ms: body.duration,
                    async_mode: body.async_mode,
                    sharding,
                },
                ctx.can_create_namespace,
            )
            .await?;
        Ok(stored.into())
    }
    .await;

    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => err.into_response(&request_id),
    }
}

/// `POST /v1/ratelimit.getOverride` request body.
#[derive(Debug, Deserialize)]
pub struct GetOverrideBody {
    #[serde(flatten)]
    namespace: NamespaceRef,
    identifier: String,
}

/// `POST /v1/ratelimit.getOverride`
pub async fn get_override(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Result<Json<GetOverrideBody>, JsonRejection>,
) -> Response {
    let result: Result<OverrideBody, ApiError> = async {
        let body = parse_body(body)?;
        validate_identifier(&body.identifier)?;
        let selector = body.namespace.selector()?;
        let ctx = authorize(&state, &headers).await?;
        let found = state.admin.get_override(&ctx.workspace_id, &selector, &body.identifier).await?;
        Ok(found.into())
    }
    .await;

    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => err.into_response(&request_id),
    }
}

/// `POST /v1/ratelimit.listOverrides` request body.
#[derive(Debug, Deserialize)]
pub struct ListOverridesBody {
    #[serde(flatten)]
    namespace: NamespaceRef,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// `POST /v1/ratelimit.listOverrides` response body.
#[derive(Debug, Serialize)]
pub struct ListOverridesResponseBody {
    overrides: Vec<OverrideBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
}

/// `POST /v1/ratelimit.listOverrides`
pub async fn list_overrides(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Result<Json<ListOverridesBody>, JsonRejection>,
) -> Response {
    let result: Result<ListOverridesResponseBody, ApiError> = async {
        let body = parse_body(body)?;
        let selector = body.namespace.selector()?;
        let page_size = body.limit.unwrap_or(DEFAULT_OVERRIDE_PAGE_SIZE).min(MAX_OVERRIDE_PAGE_SIZE);
        if page_size == 0 {
            return Err(ApiError::bad_request("limit must be at least 1"));
        }
        let ctx = authorize(&state, &headers).await?;
        let (rows, cursor) = state
            .admin
            .list_overrides(&ctx.workspace_id, &selector, body.cursor, page_size)
            .await?;
        Ok(ListOverridesResponseBody {
            overrides: rows.into_iter().map(OverrideBody::from).collect(),
            cursor,
        })
    }
    .await;

    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => err.into_response(&request_id),
    }
}

/// `POST /v1/ratelimit.deleteOverride` request body.
#[derive(Debug, Deserialize)]
pub struct DeleteOverrideBody {
    #[serde(flatten)]
    namespace: NamespaceRef,
    identifier: String,
}

/// `POST /v1/ratelimit.deleteOverride`
pub async fn delete_override(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Result<Json<DeleteOverrideBody>, JsonRejection>,
) -> Response {
    let result: Result<(), ApiError> = async {
        let body = parse_body(body)?;
        validate_identifier(&body.identifier)?;
        let selector = body.namespace.selector()?;
        let ctx = authorize(&state, &headers).await?;
        if !ctx.can_manage_overrides {
            return Err(ApiError::new(ErrorCode::Forbidden, "missing permission to manage overrides"));
        }
        state.admin.delete_override(&ctx.workspace_id, &selector, &body.identifier).await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({}))).into_response(),
        Err(err) => err.into_response(&request_id),
    }
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    let stats = state.service.stats().snapshot();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "node": state.node_id,
            "deltasDropped": stats.deltas_dropped,
            "originPushFailures": stats.origin_push_failures,
        })),
    )
        .into_response()
}
