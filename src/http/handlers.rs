//! Route handlers for the session API.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Serialize;
use tracing::{debug, info_span, Instrument};

use super::identity::{identity_from_headers, requested_protocols};
use super::stream::client_endpoint;
use super::AppState;
use crate::models::identity::Identity;
use crate::models::session::{SessionRecord, SessionStatus};
use crate::Result;

/// Response body for lifecycle operations.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// Status after the operation.
    pub status: SessionStatus,
}

impl From<SessionRecord> for SessionSummary {
    fn from(record: SessionRecord) -> Self {
        Self {
            session_id: record.session_id,
            status: record.status,
        }
    }
}

/// Response body for `DELETE /sessions/{id}`.
#[derive(Debug, Serialize)]
pub struct DestroyResponse {
    /// Always `true`; failures are reported as errors.
    pub success: bool,
}

fn caller(state: &AppState, headers: &HeaderMap) -> Result<Identity> {
    identity_from_headers(headers, &state.identity)
}

/// `GET /health`
pub async fn health() -> &'static str {
    "ok"
}

/// `POST /sessions`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<SessionSummary>)> {
    let identity = caller(&state, &headers)?;
    let record = state.registry.create(&identity).await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

/// `POST /sessions/{id}/start`
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionSummary>> {
    let identity = caller(&state, &headers)?;
    let controller = state.registry.get(&session_id).await?;
    let record = controller.start(&identity).await?;
    Ok(Json(record.into()))
}

/// `POST /sessions/{id}/stop`
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionSummary>> {
    let identity = caller(&state, &headers)?;
    let controller = state.registry.get(&session_id).await?;
    let record = controller.stop(&identity).await?;
    Ok(Json(record.into()))
}

/// `DELETE /sessions/{id}`
pub async fn destroy_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DestroyResponse>> {
    let identity = caller(&state, &headers)?;
    state.registry.destroy(&session_id, &identity).await?;
    Ok(Json(DestroyResponse { success: true }))
}

/// `GET /sessions/{id}`
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionRecord>> {
    let identity = caller(&state, &headers)?;
    let controller = state.registry.get(&session_id).await?;
    Ok(Json(controller.status(&identity)?))
}

/// `GET /sessions/{id}/ws`
///
/// Authorization and the sandbox-side connection happen before the
/// upgrade, so a refused caller gets a plain HTTP error.
pub async fn session_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let identity = caller(&state, &headers)?;
    let controller = state.registry.get(&session_id).await?;
    let grant = controller
        .open_stream(&identity, requested_protocols(&headers))
        .await?;

    let ws = match grant.protocol() {
        Some(protocol) => ws.protocols([protocol.to_owned()]),
        None => ws,
    };
    let span = info_span!(
        "client_stream",
        session_id = %session_id,
        stream_id = grant.stream_id()
    );

    Ok(ws.on_upgrade(move |socket| {
        async move {
            let outcome = grant.run(client_endpoint(socket)).await;
            debug!(outcome = %outcome.describe(), "client stream finished");
        }
        .instrument(span)
    }))
}
