//! Caller identity taken from proxy-attached headers.

use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::HeaderMap;

use crate::config::IdentityConfig;
use crate::models::identity::Identity;
use crate::{AppError, Result};

/// Build the caller identity from request headers.
///
/// The user header is required; the groups header is an optional
/// comma-separated list with blank entries ignored.
///
/// # Errors
///
/// Returns `AppError::Unauthenticated` if the user header is missing,
/// empty, or not valid UTF-8.
pub fn identity_from_headers(headers: &HeaderMap, config: &IdentityConfig) -> Result<Identity> {
    let owner_id = headers
        .get(config.user_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::Unauthenticated("missing caller identity".into()))?;

    let groups = headers
        .get(config.groups_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(split_list)
        .unwrap_or_default();

    Ok(Identity::new(owner_id).with_groups(groups))
}

/// Sub-protocols the client offered, in order.
#[must_use]
pub fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(split_list)
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}
