//! Session record and lifecycle helpers.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Lifecycle status for a sandbox session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Record exists, sandbox never started.
    Created,
    /// Sandbox start in flight.
    Starting,
    /// Sandbox up and reachable.
    Running,
    /// Sandbox torn down; may be started again.
    Stopped,
    /// Last start attempt failed.
    Error,
}

impl SessionStatus {
    /// Stable lowercase name, matching the persisted form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted state of one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Server-generated identifier, stable for the session's lifetime.
    pub session_id: String,
    /// Stable identifier of the creating user; immutable after creation.
    pub owner: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last authorized interaction; drives idle shutdown.
    pub last_seen: DateTime<Utc>,
    /// Cause of the last failed start; only set while `status == Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SessionRecord {
    /// Construct a fresh `Created` record with a generated identifier.
    #[must_use]
    pub fn new(owner: String, now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            owner,
            status: SessionStatus::Created,
            created_at: now,
            last_seen: now,
            error_message: None,
        }
    }

    /// Record an interaction at `now`, never moving `last_seen` before `created_at`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now.max(self.created_at);
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `Starting -> Starting` re-drives a start interrupted by a restart.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::{Created, Error, Running, Starting, Stopped};
        matches!(
            (self.status, next),
            (Created | Stopped | Error | Starting, Starting)
                | (Starting, Running | Error)
                | (Created | Starting | Running | Error, Stopped)
        )
    }

    /// Move to `next`, clearing `error_message` unless entering `Error`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the transition is not permitted;
    /// the record is left untouched.
    pub fn transition_to(&mut self, next: SessionStatus) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "cannot move session from {} to {next}",
                self.status
            )));
        }
        self.status = next;
        if next != SessionStatus::Error {
            self.error_message = None;
        }
        Ok(())
    }
}
