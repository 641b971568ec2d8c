//! Error classification.
//!
//! Turns whatever went wrong with a call into an [`ErrorRecord`]. The retryable status
//! set lives here as [`RetryableStatuses`] and is shared with the retry policy, so the
//! classifier's `retryable` flag and the policy's status check cannot drift apart.

use crate::error::{ErrorKind, ErrorRecord};
use crate::transport::TransportError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Default statuses treated as transient.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Set of HTTP statuses considered transient.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<u16>")]
pub struct RetryableStatuses(BTreeSet<u16>);

impl RetryableStatuses {
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self(statuses.into_iter().collect())
    }

    pub fn contains(&self, status: u16) -> bool {
        self.0.contains(&status)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }
}

impl Default for RetryableStatuses {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_STATUSES)
    }
}

impl From<Vec<u16>> for RetryableStatuses {
    fn from(statuses: Vec<u16>) -> Self {
        Self::new(statuses)
    }
}

/// Anything that can go wrong with a single transport attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFailure {
    /// No response was received.
    Transport(TransportError),
    /// A response arrived with a non-2xx status.
    Status { status: u16, body: Value },
    /// Neither of the above, e.g. a response body the caller could not decode.
    Other(String),
}

/// Maps raw failures to normalized records.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    retryable: Arc<RetryableStatuses>,
}

impl ErrorClassifier {
    pub fn new(retryable: Arc<RetryableStatuses>) -> Self {
        Self { retryable }
    }

    pub fn retryable_statuses(&self) -> &RetryableStatuses {
        &self.retryable
    }

    pub fn classify(&self, raw: RawFailure) -> ErrorRecord {
        match raw {
            RawFailure::Transport(TransportError::Timeout) => {
                ErrorRecord::new(ErrorKind::Timeout, "request timed out").with_retryable(true)
            }
            RawFailure::Transport(err) => {
                ErrorRecord::new(ErrorKind::NetworkError, err.to_string()).with_retryable(true)
            }
            RawFailure::Status { status, body } => self.classify_status(status, &body),
            RawFailure::Other(message) => ErrorRecord::new(ErrorKind::UnknownError, message),
        }
    }

    fn classify_status(&self, status: u16, body: &Value) -> ErrorRecord {
        let kind = body_codes(body)
            .into_iter()
            .find_map(ErrorKind::from_code)
            .filter(|kind| !matches!(kind, ErrorKind::Cancelled))
            .unwrap_or_else(|| kind_for_status(status));

        let message = body_message(body).unwrap_or_else(|| status_text(status).to_string());
        let mut record = ErrorRecord::new(kind, message)
            .with_status(status)
            .with_retryable(self.retryable.contains(status));
        if let Some(details) = body_details(body) {
            record = record.with_details(details.clone());
        }
        record
    }
}

/// Fixed status → kind table.
pub fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        400 | 422 => ErrorKind::ValidationError,
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        408 => ErrorKind::Timeout,
        409 => ErrorKind::Conflict,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::UnknownError,
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unexpected response status",
    }
}

// Codes in priority order; sub-codes first so a 401 carrying `sub_code: TOKEN_EXPIRED`
// under a generic `code: UNAUTHORIZED` is recognized as expired.
fn body_codes(body: &Value) -> Vec<&str> {
    let error = body.get("error");
    [
        body.get("sub_code"),
        body.get("subCode"),
        error.and_then(|e| e.get("sub_code")),
        error.and_then(|e| e.get("subCode")),
        body.get("code"),
        error.and_then(|e| e.get("code")),
        error,
        body.get("error_code"),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .collect()
}

fn body_message(body: &Value) -> Option<String> {
    let error = body.get("error");
    body.get("message")
        .or_else(|| error.and_then(|e| e.get("message")))
        .or_else(|| body.get("detail"))
        .and_then(Value::as_str)
        .or_else(|| {
            error.and_then(Value::as_str).filter(|s| ErrorKind::from_code(s).is_none())
        })
        .map(str::to_string)
}

fn body_details(body: &Value) -> Option<&Value> {
    body.get("details").or_else(|| body.get("error").and_then(|e| e.get("details")))
}
