//! HTTP handlers for the broker endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness |
//! | `GET` | `/v1/config` | Read backend configuration (`url` only) |
//! | `POST`/`PUT` | `/v1/config` | Create or update backend configuration |
//! | `DELETE` | `/v1/config` | Delete backend configuration |
//! | `GET` | `/v1/role` | List role names |
//! | `GET` | `/v1/role/{name}` | Read a role |
//! | `POST`/`PUT` | `/v1/role/{name}` | Create or update a role |
//! | `DELETE` | `/v1/role/{name}` | Delete a role |
//! | `GET`/`POST` | `/v1/creds/{name}` | Issue a credential for a role |
//! | `POST` | `/v1/lease/revoke` | Lease scheduler: revoke (scheduler token) |
//! | `POST` | `/v1/lease/renew` | Lease scheduler: renew (scheduler token) |
//!
//! ## Errors
//!
//! Failures are JSON `{"error": <kind>, "message": <text>}` with the status
//! from [`status_for`].
//!
//! ## Scheduler Authentication
//!
//! When `server.scheduler_token` is configured, the lease endpoints require
//! `Authorization: Bearer <scheduler_token>`. Without it they are open and
//! access control is left to the host.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{error, warn};

use super::{
    Broker, ConfigUpdate, Credential, IssueRequest, LeaseOperation, LeaseOutcome, RoleUpdate,
    Secret,
};
use crate::Error;

/// Shared handler state
pub struct AppState {
    /// The broker
    pub broker: Arc<Broker>,
    /// Bearer token required on lease callbacks, if any
    pub scheduler_token: Option<String>,
}

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the broker routes.
pub fn broker_routes(broker: Arc<Broker>, scheduler_token: Option<String>) -> Router {
    let state = Arc::new(AppState {
        broker,
        scheduler_token: scheduler_token.filter(|t| !t.is_empty()),
    });

    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/config",
            get(read_config)
                .post(write_config)
                .put(write_config)
                .delete(delete_config),
        )
        .route("/v1/role", get(list_roles))
        .route(
            "/v1/role/{name}",
            get(read_role)
                .post(write_role)
                .put(write_role)
                .delete(delete_role),
        )
        .route("/v1/creds/{name}", get(issue_query).post(issue_body))
        .route("/v1/lease/revoke", post(revoke_lease))
        .route("/v1/lease/renew", post(renew_lease))
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `GET /health`
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

/// `GET /v1/config`
async fn read_config(State(state): State<Arc<AppState>>) -> Result<Response, Error> {
    let view = state
        .broker
        .read_config()
        .await?
        .ok_or_else(|| Error::NotFound("backend is not configured".to_string()))?;
    Ok(Json(view).into_response())
}

/// `POST|PUT /v1/config`
async fn write_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Response, Error> {
    let view = state.broker.write_config(update).await?;
    Ok(Json(view).into_response())
}

/// `DELETE /v1/config`
async fn delete_config(State(state): State<Arc<AppState>>) -> Result<Response, Error> {
    state.broker.delete_config().await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /v1/role`
async fn list_roles(State(state): State<Arc<AppState>>) -> Result<Response, Error> {
    let keys = state.broker.list_roles().await?;
    Ok(Json(json!({"keys": keys})).into_response())
}

/// `GET /v1/role/{name}`
async fn read_role(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, Error> {
    let view = state
        .broker
        .read_role(&name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("role '{name}' not found")))?;
    Ok(Json(view).into_response())
}

/// `POST|PUT /v1/role/{name}`
async fn write_role(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(update): Json<RoleUpdate>,
) -> Result<Response, Error> {
    let view = state.broker.write_role(&name, update).await?;
    Ok(Json(view).into_response())
}

/// `DELETE /v1/role/{name}`
async fn delete_role(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, Error> {
    state.broker.delete_role(&name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /v1/creds/{name}?balenaName=..&balenaDesc=..&ttl=..`
async fn issue_query(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(request): Query<IssueRequest>,
) -> Result<Json<Credential>, Error> {
    Ok(Json(state.broker.issue(&name, request).await?))
}

/// `POST /v1/creds/{name}` with the same fields as a JSON body; the body may be empty
async fn issue_body(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Credential>, Error> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        IssueRequest::default()
    } else {
        parse_json(&body).map_err(Error::Validation)?
    };
    Ok(Json(state.broker.issue(&name, request).await?))
}

/// `POST /v1/lease/revoke`
async fn revoke_lease(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = check_scheduler_auth(&state, &headers) {
        return response;
    }
    let secret: Secret = match parse_json(&body) {
        Ok(secret) => secret,
        Err(message) => return Error::MalformedLease(message).into_response(),
    };
    match state.broker.handle_lease(LeaseOperation::Revoke, &secret).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /v1/lease/renew`
async fn renew_lease(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = check_scheduler_auth(&state, &headers) {
        return response;
    }
    let secret: Secret = match parse_json(&body) {
        Ok(secret) => secret,
        Err(message) => return Error::MalformedLease(message).into_response(),
    };
    match state.broker.handle_lease(LeaseOperation::Renew, &secret).await {
        Ok(LeaseOutcome::Renewed(renewed)) => Json(renewed).into_response(),
        Ok(LeaseOutcome::Revoked) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Decode a JSON request body read as raw bytes.
fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, String> {
    serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))
}

/// Check `Authorization: Bearer <token>` against the scheduler token.
#[allow(clippy::result_large_err)]
fn check_scheduler_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    use subtle::ConstantTimeEq;

    let Some(ref expected) = state.scheduler_token else {
        return Ok(());
    };

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });

    // Constant-time comparison to prevent timing side-channels
    let matches = provided.is_some_and(|p| p.as_bytes().ct_eq(expected.as_bytes()).into());

    if matches {
        Ok(())
    } else {
        warn!("Rejected lease callback with invalid scheduler token");
        Err((
            StatusCode::UNAUTHORIZED,
            [("WWW-Authenticate", "Bearer")],
            Json(json!({
                "error": "unauthorized",
                "message": "Invalid scheduler token"
            })),
        )
            .into_response())
    }
}

/// HTTP status for each error kind
#[must_use]
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::MalformedLease(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Upstream(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
        Error::Config(_)
        | Error::Storage(_)
        | Error::Io(_)
        | Error::Json(_)
        | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "Request failed");
        }
        (
            status,
            Json(json!({"error": self.kind(), "message": self.to_string()})),
        )
            .into_response()
    }
}
