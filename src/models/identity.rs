//! Caller identity claims attached to every request.

use serde::{Deserialize, Serialize};

/// The minimal claims the controller needs for authorization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    /// Stable user identifier (not a display name).
    pub owner_id: String,
    /// Groups the caller belongs to.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    /// Identity with no group memberships.
    #[must_use]
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            groups: Vec::new(),
        }
    }

    /// Add group memberships.
    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Whether the caller belongs to `group`.
    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}
