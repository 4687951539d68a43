//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Caller failed the authorization gate for this session.
    Forbidden(String),
    /// A session record already exists for this controller.
    Conflict(String),
    /// Requested session does not exist (or was destroyed).
    NotFound(String),
    /// Operation is incompatible with the current session status.
    InvalidState(String),
    /// Sandbox start, destroy, or stream-open failure.
    Upstream(String),
    /// Request carried no usable identity.
    Unauthenticated(String),
    /// File-system or socket I/O failure.
    Io(String),
}

impl AppError {
    /// Short machine-readable kind used in HTTP error bodies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Db(_) => "db",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Upstream(_) => "upstream",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Io(_) => "io",
        }
    }

    /// The message without its kind prefix.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::Db(msg)
            | Self::Forbidden(msg)
            | Self::Conflict(msg)
            | Self::NotFound(msg)
            | Self::InvalidState(msg)
            | Self::Upstream(msg)
            | Self::Unauthenticated(msg)
            | Self::Io(msg) => msg,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream: {msg}"),
            Self::Unauthenticated(msg) => write!(f, "unauthenticated: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Upstream(format!("sandbox stream: {err}"))
    }
}

impl From<axum::Error> for AppError {
    fn from(err: axum::Error) -> Self {
        Self::Io(format!("client stream: {err}"))
    }
}
