//! Structured session events.
//!
//! The controller emits one [`SessionEvent`] per lifecycle or stream
//! event through an [`EventSink`]. Consumers (log shippers, the
//! list-by-owner index) read them; the controller never does. The primary
//! implementation, [`JsonlEventWriter`], appends JSONL records to
//! daily-rotating files.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Record created.
    SessionCreated,
    /// Sandbox reached `running`.
    SessionStarted,
    /// Sandbox torn down (explicit stop or idle timeout).
    SessionStopped,
    /// Record deleted.
    SessionDestroyed,
    /// Client stream relay opened.
    StreamConnected,
    /// Client stream relay closed.
    StreamDisconnected,
    /// Sandbox start failed.
    Error,
}

impl EventKind {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionStarted => "session_started",
            Self::SessionStopped => "session_stopped",
            Self::SessionDestroyed => "session_destroyed",
            Self::StreamConnected => "stream_connected",
            Self::StreamDisconnected => "stream_disconnected",
            Self::Error => "error",
        }
    }
}

/// One structured event record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEvent {
    /// Event classification.
    pub event: EventKind,
    /// Session the event belongs to.
    pub session_id: String,
    /// Session owner.
    pub owner: String,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Free-form detail (failure cause, stop reason).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SessionEvent {
    /// Construct an event without a message.
    #[must_use]
    pub fn new(
        event: EventKind,
        session_id: impl Into<String>,
        owner: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event,
            session_id: session_id.into(),
            owner: owner.into(),
            timestamp,
            message: None,
        }
    }

    /// Attach a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Receives session events.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait EventSink: Send + Sync {
    /// Record a single event.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails. Callers treat
    /// sink failures as non-fatal.
    fn emit(&self, event: &SessionEvent) -> crate::Result<()>;
}

pub use writer::JsonlEventWriter;
