//! Store-specific error handling.

use annolink_core::{defaults, Error};

/// Classification of non-success store responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    /// Stale `If-Match` precondition.
    VersionConflict,
    /// Item does not exist.
    NotFound,
    /// Invalid or missing credential.
    Unauthorized,
    /// Upstream gateway failure; assumed structural.
    Gateway,
    /// Other server error.
    ServerError,
    /// Other client error.
    ClientError,
}

impl StoreErrorCode {
    /// Determine error code from HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            409 | 412 => Self::VersionConflict,
            404 | 410 => Self::NotFound,
            401 | 403 => Self::Unauthorized,
            s if defaults::GATEWAY_FAILURE_STATUSES.contains(&s) => Self::Gateway,
            500..=599 => Self::ServerError,
            _ => Self::ClientError,
        }
    }

    /// Check if this error is retryable as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerError)
    }
}

/// Convert a failed store response into an annolink Error.
pub fn to_annolink_error(status: u16, context: &str, message: &str) -> Error {
    let message = if message.trim().is_empty() {
        context.to_string()
    } else {
        format!("{}: {}", context, truncate(message, 300))
    };
    match StoreErrorCode::from_status(status) {
        StoreErrorCode::VersionConflict => Error::VersionConflict(message),
        StoreErrorCode::NotFound => Error::NotFound(message),
        StoreErrorCode::Unauthorized => Error::Unauthorized(message),
        StoreErrorCode::Gateway => Error::Gateway { status, message },
        StoreErrorCode::ServerError | StoreErrorCode::ClientError => {
            Error::Status { status, message }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
