//! Thin HTTP ingress over the dispatcher plus tenant-scoped diagnostics.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use courier_core::domain::action::ActionType;
use courier_core::domain::idempotency::IdempotencyKey;
use courier_core::domain::tenant::{hash_api_key, Tenant};
use courier_core::errors::ErrorKind;
use courier_db::repositories::{ActionLogRepository, TenantRepository};
use courier_dispatch::{ActionDispatcher, ActionRequest, DispatchError};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

const DEFAULT_RECENT_LIMIT: u32 = 50;
const MAX_RECENT_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: ActionDispatcher,
    pub tenants: Arc<dyn TenantRepository>,
    pub action_logs: Arc<dyn ActionLogRepository>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/actions", get(recent_actions))
        .route("/v1/actions/stats", get(action_stats))
        .route("/v1/actions/{action_type}", post(dispatch_action))
        .route("/v1/providers/status", get(provider_status))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    code: &'static str,
    message: String,
    retry_after_ms: Option<u64>,
}

impl ApiError {
    fn new(
        status: StatusCode,
        kind: ErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self { status, kind, code, message: message.into(), retry_after_ms: None }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorKind::Validation, "unauthorized", message)
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::Validation, code, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "kind": self.kind.as_str(),
            "code": self.code,
            "message": self.message,
        });
        if let Some(retry_after_ms) = self.retry_after_ms {
            error["retry_after_ms"] = json!(retry_after_ms);
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

async fn authenticate(headers: &HeaderMap, state: &AppState) -> Result<Tenant, ApiError> {
    let raw_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing x-api-key header"))?;

    let tenant = state
        .tenants
        .find_by_api_key_hash(&hash_api_key(raw_key))
        .await
        .map_err(|repo_error| ApiError::internal(repo_error.to_string()))?
        .ok_or_else(|| ApiError::unauthorized("unknown api key"))?;

    if !tenant.is_active {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            ErrorKind::Validation,
            "tenant_inactive",
            format!("tenant `{}` is inactive", tenant.slug),
        ));
    }

    Ok(tenant)
}

async fn dispatch_action(
    State(state): State<AppState>,
    Path(raw_action_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let tenant = authenticate(&headers, &state).await?;

    let action_type = ActionType::parse(&raw_action_type).ok_or_else(|| {
        ApiError::bad_request(
            "unknown_action_type",
            format!("unknown action type `{raw_action_type}`"),
        )
    })?;

    let idempotency_key = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        None => None,
        Some(value) => {
            let parsed = value.to_str().ok().and_then(IdempotencyKey::parse);
            Some(parsed.ok_or_else(|| {
                ApiError::bad_request(
                    "invalid_idempotency_key",
                    "idempotency-key must be 1-255 printable ASCII characters",
                )
            })?)
        }
    };

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|parse_error| ApiError::bad_request("invalid_json", parse_error.to_string()))?;

    let mut request = ActionRequest::new(tenant, action_type, payload)
        .with_route("POST", format!("/v1/actions/{}", action_type.as_str()));
    if let Some(correlation_id) =
        headers.get(CORRELATION_HEADER).and_then(|value| value.to_str().ok())
    {
        request = request.with_correlation_id(correlation_id);
    }
    if let Some(key) = idempotency_key {
        request = request.with_idempotency_key(key);
    }

    match state.dispatcher.dispatch(request).await {
        Ok(outcome) => {
            let status =
                StatusCode::from_u16(outcome.response.status_code).unwrap_or(StatusCode::OK);
            let mut response = (status, Json(outcome.response.body)).into_response();
            if outcome.replayed {
                response.headers_mut().insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
            }
            Ok(response)
        }
        Err(DispatchError::Validation { response, .. }) => {
            Ok((StatusCode::BAD_REQUEST, Json(response.body)).into_response())
        }
        Err(dispatch_error @ DispatchError::Conflict { .. }) => Err(ApiError::new(
            StatusCode::CONFLICT,
            ErrorKind::Conflict,
            "idempotency_key_reused",
            dispatch_error.to_string(),
        )),
        Err(DispatchError::InProgress { key, retry_after_ms }) => Err(ApiError {
            retry_after_ms: Some(retry_after_ms),
            ..ApiError::new(
                StatusCode::CONFLICT,
                ErrorKind::InProgress,
                "request_in_progress",
                format!("a request with idempotency key `{key}` is still in flight"),
            )
        }),
        Err(dispatch_error) => {
            error!(
                event_name = "api.dispatch.failed",
                error = %dispatch_error,
                "dispatch failed with an internal error"
            );
            Err(ApiError::internal(dispatch_error.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<u32>,
}

async fn recent_actions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Value>, ApiError> {
    let tenant = authenticate(&headers, &state).await?;
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT);

    let actions = state
        .action_logs
        .list_recent(&tenant.id, limit)
        .await
        .map_err(|repo_error| ApiError::internal(repo_error.to_string()))?;

    Ok(Json(json!({ "tenant_id": tenant.id.0, "actions": actions })))
}

async fn action_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let tenant = authenticate(&headers, &state).await?;
    let stats = state
        .action_logs
        .stats(Some(&tenant.id))
        .await
        .map_err(|repo_error| ApiError::internal(repo_error.to_string()))?;

    Ok(Json(json!({ "tenant_id": tenant.id.0, "stats": stats })))
}

async fn provider_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.dispatcher.registry().status()))
}
