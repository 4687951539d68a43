//! Sandbox capability abstraction.
//!
//! The controller never touches an isolated-compute backend directly. It
//! holds a [`SandboxBackend`] that hands out one [`SandboxHandle`] per
//! session, and calls only `start`, `destroy`, and `open_stream` on it.

pub mod http_backend;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::relay::Endpoint;
use crate::Result;

/// Options passed to [`SandboxHandle::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Allow the sandbox to reach the public internet.
    pub enable_outbound_network: bool,
}

/// An open stream to a sandbox-internal port.
pub struct SandboxStream {
    /// Frames to and from the sandbox service.
    pub endpoint: Endpoint,
    /// Sub-protocol the sandbox service selected, if any.
    pub protocol: Option<String>,
}

/// Operations on one isolated compute unit.
pub trait SandboxHandle: Send + Sync {
    /// Boot the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Upstream`](crate::AppError::Upstream) if the
    /// sandbox fails to start.
    fn start(&self, options: StartOptions) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Tear the sandbox down. Succeeds when it is already gone.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Upstream`](crate::AppError::Upstream) on a
    /// provider failure other than "not found".
    fn destroy(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Open a stream to `port` inside the sandbox, offering `protocols`
    /// as the websocket sub-protocols verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Upstream`](crate::AppError::Upstream) if the
    /// stream cannot be established.
    fn open_stream(
        &self,
        port: u16,
        protocols: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<SandboxStream>> + Send + '_>>;
}

/// Resolves the sandbox handle for a session.
pub trait SandboxBackend: Send + Sync {
    /// Handle for the sandbox backing `session_id`.
    fn handle(&self, session_id: &str) -> Arc<dyn SandboxHandle>;
}
