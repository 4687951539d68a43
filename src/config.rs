//! Global configuration parsing and validation.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Idle shutdown thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct IdleConfig {
    /// Maximum time a running session may go without activity.
    #[serde(default = "default_idle_threshold")]
    pub threshold_seconds: u64,
    /// How often the idle monitor evaluates a running session.
    #[serde(default = "default_idle_check_interval")]
    pub check_interval_seconds: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            threshold_seconds: default_idle_threshold(),
            check_interval_seconds: default_idle_check_interval(),
        }
    }
}

fn default_idle_threshold() -> u64 {
    1800
}

fn default_idle_check_interval() -> u64 {
    60
}

/// Sandbox provider connectivity.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SandboxConfig {
    /// Base URL of the sandbox provider API (`http://` or `https://`).
    pub provider_url: String,
    /// Internal port of the terminal/display service inside each sandbox.
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    /// Timeout applied to provider start/destroy calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_stream_port() -> u16 {
    7681
}

fn default_request_timeout() -> u64 {
    30
}

/// Header names carrying the caller identity, attached by the fronting proxy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct IdentityConfig {
    /// Header holding the stable user identifier.
    #[serde(default = "default_user_header")]
    pub user_header: String,
    /// Header holding a comma-separated group list.
    #[serde(default = "default_groups_header")]
    pub groups_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
            groups_header: default_groups_header(),
        }
    }
}

fn default_user_header() -> String {
    "x-auth-user".into()
}

fn default_groups_header() -> String {
    "x-auth-groups".into()
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_http_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/sessions.db")
}

fn default_event_log_dir() -> PathBuf {
    PathBuf::from("data/events")
}

fn default_admin_group() -> String {
    "admin".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Interface the session API binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// HTTP port for the session API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// `SQLite` database file holding session records.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Directory receiving the daily JSONL event log.
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: PathBuf,
    /// Members of this group may operate on any session.
    #[serde(default = "default_admin_group")]
    pub admin_group: String,
    /// Idle shutdown thresholds.
    #[serde(default)]
    pub idle: IdleConfig,
    /// Sandbox provider settings.
    pub sandbox: SandboxConfig,
    /// Identity header names.
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Socket address the session API listens on.
    #[must_use]
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.http_port)
    }

    /// Idle threshold as a [`Duration`].
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle.threshold_seconds)
    }

    /// Idle check interval as a [`Duration`].
    #[must_use]
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle.check_interval_seconds)
    }

    /// Provider request timeout as a [`Duration`].
    #[must_use]
    pub fn sandbox_request_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.request_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.idle.threshold_seconds == 0 {
            return Err(AppError::Config(
                "idle.threshold_seconds must be greater than zero".into(),
            ));
        }

        if self.idle.check_interval_seconds == 0 {
            return Err(AppError::Config(
                "idle.check_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.admin_group.trim().is_empty() {
            return Err(AppError::Config("admin_group must not be empty".into()));
        }

        let url = self.sandbox.provider_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "sandbox.provider_url must be an http(s) URL, got {url:?}"
            )));
        }

        if self.identity.user_header.trim().is_empty() {
            return Err(AppError::Config(
                "identity.user_header must not be empty".into(),
            ));
        }

        Ok(())
    }
}
