//! Error types for annolink.

use thiserror::Error;

/// Result type alias using annolink's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for annolink operations.
///
/// `Clone` so that a single fetch outcome can be handed to every caller
/// attached to the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Missing or invalid configuration (credential, base URL)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient HTTP/network failure (connection reset, DNS, body read)
    #[error("Request error: {0}")]
    Request(String),

    /// Request exceeded its timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The store rejected a write carrying a stale version token
    #[error("Version conflict on {0}: re-read and re-evaluate")]
    VersionConflict(String),

    /// Upstream gateway failure (502/504), treated as structural
    #[error("Gateway failure (HTTP {status}): {message}")]
    Gateway { status: u16, message: String },

    /// Any other non-success status from the store
    #[error("Store returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication/authorization failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A linking annotation violates a structural invariant
    #[error("Invalid annotation: {0}")]
    InvalidAnnotation(String),

    /// A proposed link collides with existing linking annotations
    #[error("Link conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Failures a caller may retry through the circuit-breaker policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Request(_) | Error::Timeout(_))
            || matches!(self, Error::Status { status, .. } if *status >= 500)
    }

    /// Upstream gateway failures escalate to a permanently open circuit.
    pub fn is_gateway(&self) -> bool {
        matches!(self, Error::Gateway { .. })
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// HTTP status carried by the error, when the store answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Gateway { status, .. } | Error::Status { status, .. } => Some(*status),
            Error::VersionConflict(_) => Some(412),
            Error::NotFound(_) => Some(404),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing bearer token".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing bearer token");
    }

    #[test]
    fn test_error_display_version_conflict() {
        let err = Error::VersionConflict("https://store/w3c/anno/1".to_string());
        assert_eq!(
            err.to_string(),
            "Version conflict on https://store/w3c/anno/1: re-read and re-evaluate"
        );
    }

    #[test]
    fn test_error_display_gateway() {
        let err = Error::Gateway {
            status: 504,
            message: "upstream timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Gateway failure (HTTP 504): upstream timeout"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout("t".into()).is_transient());
        assert!(Error::Request("reset".into()).is_transient());
        assert!(Error::Status {
            status: 500,
            message: "boom".into()
        }
        .is_transient());
        assert!(!Error::Status {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!Error::VersionConflict("x".into()).is_transient());
        assert!(!Error::Gateway {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
    }

    #[test]
    fn test_gateway_and_conflict_predicates() {
        let gw = Error::Gateway {
            status: 502,
            message: String::new(),
        };
        assert!(gw.is_gateway());
        assert!(!gw.is_version_conflict());
        assert!(Error::VersionConflict("a".into()).is_version_conflict());
        assert!(Error::NotFound("a".into()).is_not_found());
    }

    #[test]
    fn test_status_accessor() {
        assert_eq!(
            Error::Status {
                status: 418,
                message: String::new()
            }
            .status(),
            Some(418)
        );
        assert_eq!(Error::NotFound("x".into()).status(), Some(404));
        assert_eq!(Error::Timeout("x".into()).status(), None);
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number");
        assert!(json_err.is_err());

        let err: Error = json_err.unwrap_err().into();
        match err {
            Error::Serialization(msg) => {
                assert!(!msg.is_empty());
            }
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_error_is_send_sync_clone() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        fn assert_clone<T: Clone>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
        assert_clone::<Error>();
    }
}
