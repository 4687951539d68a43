//! HTTP front end for the session controllers.
//!
//! Thin axum layer: resolve the caller identity from proxy headers, look
//! up the controller in the registry, delegate, and map [`AppError`]
//! onto status codes.
//!
//! [`AppError`]: crate::AppError

pub mod error;
pub mod handlers;
pub mod identity;
pub mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::IdentityConfig;
use crate::orchestrator::ControllerRegistry;
use crate::{AppError, Result};

/// State shared by every request handler.
pub struct AppState {
    /// Controllers indexed by session id.
    pub registry: Arc<ControllerRegistry>,
    /// Identity header names.
    pub identity: IdentityConfig,
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", post(handlers::create_session))
        .route(
            "/sessions/{id}",
            get(handlers::session_status).delete(handlers::destroy_session),
        )
        .route("/sessions/{id}/start", post(handlers::start_session))
        .route("/sessions/{id}/stop", post(handlers::stop_session))
        .route("/sessions/{id}/ws", get(handlers::session_stream))
        .with_state(state)
}

/// Bind `addr` and serve until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the listener cannot be bound or the server
/// fails.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr, ct: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Io(format!("failed to bind {addr}: {err}")))?;
    serve_listener(state, listener, ct).await
}

/// Serve on an already bound listener until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve_listener(
    state: Arc<AppState>,
    listener: TcpListener,
    ct: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Io(format!("listener has no local address: {err}")))?;
    info!(%local, "session API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    info!("session API shut down");
    Ok(())
}
