//! Authorization gate for session operations.
//!
//! Decides whether a caller may act on a session. Evaluation order:
//! 1. No record yet (pre-creation) → allow.
//! 2. Caller is the recorded owner → allow.
//! 3. Caller belongs to the admin group → allow.
//! 4. Otherwise deny.

use tracing::debug;

use crate::models::identity::Identity;
use crate::models::session::SessionRecord;
use crate::{AppError, Result};

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Caller may proceed.
    Allow,
    /// Caller must be refused before any mutation.
    Deny,
}

/// Stateless ownership/admin gate.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    admin_group: String,
}

impl AuthorizationGate {
    /// Build a gate treating `admin_group` members as superusers.
    #[must_use]
    pub fn new(admin_group: impl Into<String>) -> Self {
        Self {
            admin_group: admin_group.into(),
        }
    }

    /// Evaluate `identity` against the current record (if any).
    #[must_use]
    pub fn authorize(&self, identity: &Identity, record: Option<&SessionRecord>) -> Decision {
        let Some(record) = record else {
            return Decision::Allow;
        };

        if identity.owner_id == record.owner {
            return Decision::Allow;
        }

        if identity.in_group(&self.admin_group) {
            debug!(
                session_id = %record.session_id,
                caller = %identity.owner_id,
                "admin override"
            );
            return Decision::Allow;
        }

        Decision::Deny
    }

    /// Like [`authorize`](Self::authorize) but as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Forbidden` on denial. The message carries no
    /// detail about the session.
    pub fn ensure(&self, identity: &Identity, record: Option<&SessionRecord>) -> Result<()> {
        match self.authorize(identity, record) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(AppError::Forbidden("access denied".into())),
        }
    }
}
