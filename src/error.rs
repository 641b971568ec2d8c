//! Error types for the client runtime.
//!
//! Every failure a caller can observe is an [`ErrorRecord`]: a normalized kind, a
//! human-readable message, the HTTP status when one was received, a retryability flag
//! and optional structured details from the server body. Records are immutable once
//! built; the builder-style `with_*` methods consume and return `self`.
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Normalized failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No response was received.
    NetworkError,
    /// The request or the server timed out.
    Timeout,
    /// Credentials missing or rejected.
    Unauthorized,
    /// Credentials were valid but have expired.
    TokenExpired,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    ValidationError,
    ServerError,
    UnknownError,
    /// The caller stopped waiting via its cancellation token.
    Cancelled,
}

impl ErrorKind {
    /// Wire code for this kind, e.g. `TOKEN_EXPIRED`.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::TokenExpired => "TOKEN_EXPIRED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::UnknownError => "UNKNOWN_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }

    /// Parse a server-supplied error code. Matching ignores ASCII case so both
    /// `TOKEN_EXPIRED` and `token_expired` are recognized.
    pub fn from_code(code: &str) -> Option<Self> {
        const ALL: [ErrorKind; 12] = [
            ErrorKind::NetworkError,
            ErrorKind::Timeout,
            ErrorKind::Unauthorized,
            ErrorKind::TokenExpired,
            ErrorKind::Forbidden,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::RateLimited,
            ErrorKind::ValidationError,
            ErrorKind::ServerError,
            ErrorKind::UnknownError,
            ErrorKind::Cancelled,
        ];
        let code = code.trim();
        ALL.into_iter().find(|kind| kind.code().eq_ignore_ascii_case(code))
    }

    /// True for the two kinds that the refresh-and-replay path recovers from.
    pub fn is_auth_failure(self) -> bool {
        matches!(self, ErrorKind::Unauthorized | ErrorKind::TokenExpired)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Normalized error produced by the classifier and returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ErrorRecord {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl ErrorRecord {
    /// Create a non-retryable record with no status or details.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), status: None, retryable: false, details: None }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Shorthand for the record returned to a caller whose token fired.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled by caller")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }
}

/// Errors produced while validating client configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("backoff_factor must be finite and >= 1.0 (got {0})")]
    InvalidBackoffFactor(f64),
    #[error("max_delay ({max:?}) must be >= initial_delay ({initial:?})")]
    MaxDelayBelowInitial { initial: Duration, max: Duration },
    #[error("cache max_entries must be > 0 when set")]
    ZeroCacheCapacity,
    #[error("invalid base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("refresh path must start with '/' (got {0:?})")]
    InvalidRefreshPath(String),
    #[error("failed to parse client config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn from_code_ignores_case() {
        assert_eq!(ErrorKind::from_code("TOKEN_EXPIRED"), Some(ErrorKind::TokenExpired));
        assert_eq!(ErrorKind::from_code("token_expired"), Some(ErrorKind::TokenExpired));
        assert_eq!(ErrorKind::from_code(" rate_limited "), Some(ErrorKind::RateLimited));
        assert_eq!(ErrorKind::from_code("PIPELINE_LOCKED"), None);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = ErrorRecord::new(ErrorKind::NotFound, "pipeline 42 not found").with_status(404);
        assert_eq!(err.to_string(), "NOT_FOUND: pipeline 42 not found");
        assert!(err.source().is_none());
    }

    #[test]
    fn builder_methods_set_fields() {
        let err = ErrorRecord::new(ErrorKind::ServerError, "boom")
            .with_status(503)
            .with_retryable(true)
            .with_details(serde_json::json!({"upstream": "ingest"}));
        assert_eq!(err.kind(), ErrorKind::ServerError);
        assert_eq!(err.status(), Some(503));
        assert!(err.retryable());
        assert_eq!(err.details().unwrap()["upstream"], "ingest");
    }

    #[test]
    fn serializes_kind_as_wire_code() {
        let err = ErrorRecord::new(ErrorKind::RateLimited, "slow down").with_retryable(true);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "RATE_LIMITED");
        assert!(json.get("status").is_none());
        assert_eq!(json["retryable"], true);
    }

    #[test]
    fn auth_failure_kinds() {
        assert!(ErrorKind::Unauthorized.is_auth_failure());
        assert!(ErrorKind::TokenExpired.is_auth_failure());
        assert!(!ErrorKind::Forbidden.is_auth_failure());
    }

    #[test]
    fn config_error_messages() {
        let err = ConfigError::InvalidBackoffFactor(0.5);
        assert!(err.to_string().contains("0.5"));
        let err = ConfigError::MaxDelayBelowInitial {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("initial_delay"));
    }
}
