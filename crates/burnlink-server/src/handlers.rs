use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::{
    error::{CryptoError, EngineError},
    lifecycle::{NewSecret, ViewResult},
    store::{AccessOutcome, AuditQuery, Payload, RevokeResult},
    AppState,
};

const DEFAULT_TTL_SECS: u64 = 86400;
const DEFAULT_MAX_VIEWS: u32 = 1;

// ── Actor hints ──────────────────────────────────────────────────────────────

fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

fn owner_ref(headers: &HeaderMap, owner_header: &str) -> Option<String> {
    headers
        .get(owner_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// `ip`, then ` user=<owner>` and ` ua=<user agent>` when known.
fn actor_hint(headers: &HeaderMap, addr: &SocketAddr, owner_header: &str) -> String {
    let mut hint = extract_ip(headers, addr);
    if let Some(owner) = owner_ref(headers, owner_header) {
        hint.push_str(" user=");
        hint.push_str(&owner);
    }
    if let Some(ua) = headers.get("user-agent").and_then(|v| v.to_str().ok()) {
        hint.push_str(" ua=");
        hint.extend(ua.chars().take(200));
    }
    hint
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "audit_failures": state.lifecycle.auditor().failures(),
    }))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct FileUpload {
    pub filename: String,
    pub content_type: Option<String>,
    /// Standard base64.
    pub data: String,
}

#[derive(Deserialize)]
pub struct CreateRequest {
    pub text: Option<String>,
    pub file: Option<FileUpload>,
    pub ttl_seconds: Option<u64>,
    pub max_views: Option<u32>,
}

pub async fn create_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRequest>,
) -> Response {
    let payload = match (body.text, body.file) {
        (Some(text), None) => Payload::Text(text),
        (None, Some(file)) => match STANDARD.decode(file.data.as_bytes()) {
            Ok(data) => Payload::File {
                filename: file.filename,
                content_type: file.content_type,
                data,
            },
            Err(_) => return bad_request("file data must be base64"),
        },
        _ => return bad_request("provide exactly one of text or file"),
    };

    let default_ttl = DEFAULT_TTL_SECS.min(state.lifecycle.policy().max_ttl.as_secs());
    let new = NewSecret {
        payload,
        ttl: Duration::from_secs(body.ttl_seconds.unwrap_or(default_ttl)),
        max_views: body.max_views.unwrap_or(DEFAULT_MAX_VIEWS),
        owner_ref: owner_ref(&headers, &state.owner_header),
    };

    let lifecycle = state.lifecycle.clone();
    match tokio::task::spawn_blocking(move || lifecycle.create_secret(new)).await {
        Ok(Ok(link)) => (StatusCode::CREATED, Json(link)).into_response(),
        Ok(Err(e)) => engine_error(e),
        Err(e) => internal_error(anyhow::anyhow!("create task failed: {e}")),
    }
}

// ── View ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ViewRequest {
    pub key: String,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RevealedBody<'a> {
    Text {
        text: &'a str,
        views_remaining: u32,
    },
    File {
        filename: &'a str,
        content_type: Option<&'a str>,
        data: &'a str,
        views_remaining: u32,
    },
}

/// The key travels in the request body so it never lands in access logs.
/// The view runs to completion on a blocking thread even if the client goes
/// away: once the store has charged the view, the audit entry still gets written.
pub async fn view_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Json(body): Json<ViewRequest>,
) -> Response {
    let hint = actor_hint(&headers, &addr, &state.owner_header);
    let key = Zeroizing::new(body.key);

    let lifecycle = state.lifecycle.clone();
    let result = tokio::task::spawn_blocking(move || {
        lifecycle.view_secret(&id, &key, Some(hint.as_str()))
    })
    .await;

    match result {
        Ok(Ok(ViewResult::Revealed {
            payload,
            views_remaining,
        })) => match &payload {
            Payload::Text(text) => Json(RevealedBody::Text {
                text,
                views_remaining,
            })
            .into_response(),
            Payload::File {
                filename,
                content_type,
                data,
            } => {
                let encoded = Zeroizing::new(STANDARD.encode(data));
                Json(RevealedBody::File {
                    filename,
                    content_type: content_type.as_deref(),
                    data: &encoded,
                    views_remaining,
                })
                .into_response()
            }
        },
        Ok(Ok(ViewResult::Unavailable)) => unavailable(),
        Ok(Err(e)) => engine_error(e),
        Err(e) => internal_error(anyhow::anyhow!("view task failed: {e}")),
    }
}

// ── Owner management ─────────────────────────────────────────────────────────

pub async fn list_owned(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(owner) = owner_ref(&headers, &state.owner_header) else {
        return unauthenticated();
    };
    let lifecycle = state.lifecycle.clone();
    match tokio::task::spawn_blocking(move || lifecycle.list_owned(&owner)).await {
        Ok(Ok(metas)) => Json(json!({ "secrets": metas })).into_response(),
        Ok(Err(e)) => engine_error(e),
        Err(e) => internal_error(anyhow::anyhow!("list task failed: {e}")),
    }
}

pub async fn revoke_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(owner) = owner_ref(&headers, &state.owner_header) else {
        return unauthenticated();
    };
    let lifecycle = state.lifecycle.clone();
    match tokio::task::spawn_blocking(move || lifecycle.revoke(&id, &owner)).await {
        Ok(Ok(RevokeResult::Revoked)) => Json(json!({"revoked": true})).into_response(),
        // Someone else's secret looks exactly like a missing one.
        Ok(Ok(RevokeResult::NotOwner | RevokeResult::NotFound)) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
        }
        Ok(Err(e)) => engine_error(e),
        Err(e) => internal_error(anyhow::anyhow!("revoke task failed: {e}")),
    }
}

// ── Admin ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AccessLogParams {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub short_id: Option<String>,
    pub outcome: Option<String>,
    pub limit: Option<usize>,
}

pub async fn access_log(
    State(state): State<AppState>,
    Query(params): Query<AccessLogParams>,
) -> Response {
    let outcome = match params.outcome.as_deref().map(AccessOutcome::parse) {
        None => None,
        Some(Some(outcome)) => Some(outcome),
        Some(None) => return bad_request("unknown outcome"),
    };
    let query = AuditQuery {
        since: params.since,
        until: params.until,
        short_id: params.short_id,
        outcome,
        limit: params.limit.unwrap_or(100).min(1000),
    };
    let lifecycle = state.lifecycle.clone();
    match tokio::task::spawn_blocking(move || lifecycle.access_log(&query)).await {
        Ok(Ok(entries)) => Json(json!({ "entries": entries })).into_response(),
        Ok(Err(e)) => engine_error(e),
        Err(e) => internal_error(anyhow::anyhow!("audit task failed: {e}")),
    }
}

pub async fn sweep_secrets(State(state): State<AppState>) -> Response {
    let lifecycle = state.lifecycle.clone();
    match tokio::task::spawn_blocking(move || lifecycle.sweep_expired()).await {
        Ok(Ok(n)) => {
            info!(swept = n, "manual sweep");
            Json(json!({"swept": n})).into_response()
        }
        Ok(Err(e)) => engine_error(e),
        Err(e) => internal_error(anyhow::anyhow!("sweep task failed: {e}")),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn unavailable() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "unavailable"}))).into_response()
}

fn unauthenticated() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication required"})),
    )
        .into_response()
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
}

fn engine_error(e: EngineError) -> Response {
    match e {
        EngineError::Validation(v) => bad_request(&v.to_string()),
        EngineError::Crypto(CryptoError::PayloadTooLarge { .. }) => bad_request("payload too large"),
        EngineError::StoreUnavailable(inner) => {
            error!(error = %inner, "store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "service unavailable"})),
            )
                .into_response()
        }
        EngineError::Generation(g) => {
            error!(target: "burnlink::alert", error = %g, "short id generation failed");
            internal_error(g.into())
        }
        EngineError::Crypto(c) => internal_error(c.into()),
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
