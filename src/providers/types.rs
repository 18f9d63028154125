//! Shared types for storage providers
//!
//! This module contains the types shared by every provider plugin and by the
//! engine: the error taxonomy, declared capabilities, revision records and
//! request-scoped credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Optional operations a provider declares at registration time.
///
/// The orchestrator and pipeline branch on these flags; they never inspect
/// the concrete provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Accepts upload, delete and create_folder
    pub writable: bool,
    /// Relocates objects inside the same backend without moving bytes
    pub native_move: bool,
    /// Duplicates objects inside the same backend without moving bytes
    pub native_copy: bool,
    /// Serves byte ranges itself
    pub ranged_reads: bool,
    /// Uploads become visible only once complete
    pub atomic_replace: bool,
    /// Needs the content length before the first byte is sent
    pub requires_size_hint: bool,
    /// Lists past versions of a file
    pub revisions: bool,
    /// Addresses objects by backend ids rather than names
    pub identifier_addressed: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            writable: true,
            native_move: false,
            native_copy: false,
            ranged_reads: false,
            atomic_replace: false,
            requires_size_hint: false,
            revisions: false,
            identifier_addressed: false,
        }
    }
}

impl Capabilities {
    /// Capabilities of a backend that can only be read from
    pub fn read_only() -> Self {
        Self {
            writable: false,
            ..Self::default()
        }
    }
}

/// Request-scoped credentials and settings a provider instance is bound to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    /// Opaque auth material (token, user/password pair, ...)
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    /// Backend settings (bucket, base URL, root folder, ...)
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl ProviderCredentials {
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).map(|s| s.as_str())
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }
}

/// One past version of a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Backend-defined identifier, passed through opaquely
    pub id: String,
    pub modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Stable error classification exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPath,
    PathNotFound,
    DestinationConflict,
    PayloadTooLarge,
    ConnectionAborted,
    #[serde(rename = "integrity_error")]
    Integrity,
    BackendUnavailable,
    CallbackDeliveryExhausted,
    BadRequest,
    InvalidRange,
    NotSupported,
    #[serde(rename = "backend_error")]
    Backend,
}

impl ErrorKind {
    /// Documented error code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::PathNotFound => "path_not_found",
            ErrorKind::DestinationConflict => "destination_conflict",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::ConnectionAborted => "connection_aborted",
            ErrorKind::Integrity => "integrity_error",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::CallbackDeliveryExhausted => "callback_delivery_exhausted",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::InvalidRange => "invalid_range",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::Backend => "backend_error",
        }
    }

    /// HTTP-style status the routing layer reports for this kind
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::InvalidPath | ErrorKind::BadRequest => 400,
            ErrorKind::PathNotFound => 404,
            ErrorKind::DestinationConflict => 409,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::InvalidRange => 416,
            ErrorKind::ConnectionAborted => 499,
            ErrorKind::Integrity | ErrorKind::CallbackDeliveryExhausted => 500,
            ErrorKind::NotSupported => 501,
            ErrorKind::Backend => 502,
            ErrorKind::BackendUnavailable => 503,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider and engine error type
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Destination already exists: {0}")]
    DestinationConflict(String),

    #[error("Payload exceeds the {limit} byte upload limit")]
    PayloadTooLarge { limit: u64 },

    #[error("Connection aborted: {0}")]
    ConnectionAborted(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend refused the request credentials. Reported as unavailable,
    /// but another attempt with the same credentials cannot succeed.
    #[error("Backend unavailable: {0}")]
    AuthenticationRejected(String),

    #[error("Callback to {url} not delivered after {attempts} attempts")]
    CallbackDeliveryExhausted { url: String, attempts: u32 },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl ProviderError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::InvalidPath { .. } => ErrorKind::InvalidPath,
            ProviderError::PathNotFound(_) => ErrorKind::PathNotFound,
            ProviderError::DestinationConflict(_) => ErrorKind::DestinationConflict,
            ProviderError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            ProviderError::ConnectionAborted(_) => ErrorKind::ConnectionAborted,
            ProviderError::Integrity(_) => ErrorKind::Integrity,
            ProviderError::BackendUnavailable(_) | ProviderError::AuthenticationRejected(_) => {
                ErrorKind::BackendUnavailable
            }
            ProviderError::CallbackDeliveryExhausted { .. } => {
                ErrorKind::CallbackDeliveryExhausted
            }
            ProviderError::BadRequest(_) => ErrorKind::BadRequest,
            ProviderError::InvalidRange(_) => ErrorKind::InvalidRange,
            ProviderError::NotSupported(_) => ErrorKind::NotSupported,
            ProviderError::Backend(_) => ErrorKind::Backend,
        }
    }

    /// Only transport failures are worth another attempt, and only for reads
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::BackendUnavailable(_))
    }

    /// Errors caused by the caller's input
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ProviderError::InvalidPath { .. }
                | ProviderError::BadRequest(_)
                | ProviderError::InvalidRange(_)
                | ProviderError::PayloadTooLarge { .. }
        )
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Classify a reqwest failure without leaking its internals
    pub fn from_transport(context: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::BackendUnavailable(format!("{}: timed out", context))
        } else if err.is_connect() {
            ProviderError::BackendUnavailable(format!("{}: connection refused", context))
        } else if err.is_body() || err.is_decode() {
            ProviderError::ConnectionAborted(format!("{}: body stream interrupted", context))
        } else {
            ProviderError::BackendUnavailable(format!("{}: transport failure", context))
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::BrokenPipe | Io::ConnectionReset | Io::ConnectionAborted | Io::UnexpectedEof => {
                ProviderError::ConnectionAborted(err.kind().to_string())
            }
            Io::TimedOut => ProviderError::BackendUnavailable("I/O timed out".to_string()),
            Io::NotFound => ProviderError::PathNotFound(err.kind().to_string()),
            _ => ProviderError::Backend(format!("I/O failure ({})", err.kind())),
        }
    }
}

/// User-visible error: stable kind plus message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes_are_stable() {
        assert_eq!(ErrorKind::DestinationConflict.as_str(), "destination_conflict");
        assert_eq!(ErrorKind::DestinationConflict.status_code(), 409);
        assert_eq!(ErrorKind::PathNotFound.status_code(), 404);
        assert_eq!(ErrorKind::InvalidPath.status_code(), 400);
        assert_ne!(
            ErrorKind::DestinationConflict.status_code(),
            ErrorKind::BadRequest.status_code()
        );
    }

    #[test]
    fn test_only_backend_unavailable_is_retryable() {
        assert!(ProviderError::BackendUnavailable("x".into()).is_retryable());
        assert!(!ProviderError::PathNotFound("/a".into()).is_retryable());
        assert!(!ProviderError::invalid_path("/a", "bad").is_retryable());
        assert!(!ProviderError::DestinationConflict("/a".into()).is_retryable());
        let auth = ProviderError::AuthenticationRejected("401".into());
        assert_eq!(auth.kind(), ErrorKind::BackendUnavailable);
        assert!(!auth.is_retryable());
    }

    #[test]
    fn test_serialized_kind_matches_code() {
        let kinds = [
            ErrorKind::InvalidPath,
            ErrorKind::PathNotFound,
            ErrorKind::DestinationConflict,
            ErrorKind::PayloadTooLarge,
            ErrorKind::ConnectionAborted,
            ErrorKind::Integrity,
            ErrorKind::BackendUnavailable,
            ErrorKind::CallbackDeliveryExhausted,
            ErrorKind::BadRequest,
            ErrorKind::InvalidRange,
            ErrorKind::NotSupported,
            ErrorKind::Backend,
        ];
        for kind in kinds {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str(), "{:?}", kind);
            let back: ErrorKind = serde_json::from_value(serde_json::json!(kind.as_str())).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn test_io_errors_are_classified() {
        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(ProviderError::from(broken).kind(), ErrorKind::ConnectionAborted);

        let other = std::io::Error::new(std::io::ErrorKind::Other, "secret backend detail");
        let err = ProviderError::from(other);
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(!err.to_string().contains("secret backend detail"));
    }

    #[test]
    fn test_report_serializes_kind_as_code() {
        let report = ProviderError::PayloadTooLarge { limit: 10 }.report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "payload_too_large");
        assert!(json["message"].as_str().unwrap().contains("10"));
    }
}
