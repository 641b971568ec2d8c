//! Retry policy.
//!
//! Semantics:
//! - `max_retries` counts retries, not total attempts; `max_retries = 3` allows four
//!   transport attempts in total.
//! - A failure is retried only when the record is flagged retryable, its status (if any)
//!   is in the retryable status set, the method is in the retryable method set, fewer than
//!   `max_retries` retries were made, and the logical call is younger than `timeout`.
//! - Retry `n` waits `min(initial_delay * backoff_factor^(n-1), max_delay)`, then jitter.
//!
//! Example
//! ```rust
//! use lifeline::{ErrorKind, ErrorRecord, Method, RetryConfig, RetryDecision, RetryPolicy, RetryState};
//! use lifeline::clock::ManualClock;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let clock = Arc::new(ManualClock::new());
//! let policy = RetryPolicy::new(RetryConfig::default(), clock.clone()).unwrap();
//! let err = ErrorRecord::new(ErrorKind::ServerError, "unavailable")
//!     .with_status(503)
//!     .with_retryable(true);
//! let state = RetryState::start(Method::Get, clock.as_ref());
//! assert_eq!(
//!     policy.should_retry(&err, &state),
//!     RetryDecision::Retry { delay: Duration::from_secs(1) }
//! );
//! ```

use crate::backoff::Backoff;
use crate::classify::RetryableStatuses;
use crate::clock::Clock;
use crate::config::duration_ms;
use crate::error::{ConfigError, ErrorRecord};
use crate::jitter::Jitter;
use crate::request::Method;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Retry tuning. Deserializes with millisecond durations (`initial_delay_ms` etc.).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Budget for the whole logical call, measured from its first attempt.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub jitter: Jitter,
    pub retryable_statuses: RetryableStatuses,
    pub retryable_methods: BTreeSet<Method>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            jitter: Jitter::None,
            retryable_statuses: RetryableStatuses::default(),
            retryable_methods: [Method::Get, Method::Head, Method::Options, Method::Put, Method::Delete]
                .into_iter()
                .collect(),
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn disabled() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Check invariants and build the backoff schedule.
    pub fn validate(&self) -> Result<Backoff, ConfigError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidBackoffFactor(self.backoff_factor));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::MaxDelayBelowInitial {
                initial: self.initial_delay,
                max: self.max_delay,
            });
        }
        Backoff::exponential(self.initial_delay, self.backoff_factor)
            .and_then(|b| b.with_max(self.max_delay))
            .map_err(|_| ConfigError::InvalidBackoffFactor(self.backoff_factor))
    }
}

/// Per-logical-call retry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub method: Method,
    /// Retries already performed.
    pub attempt: usize,
    pub started_at_millis: u64,
}

impl RetryState {
    pub fn start(method: Method, clock: &dyn Clock) -> Self {
        Self { method, attempt: 0, started_at_millis: clock.now_millis() }
    }

    /// Record that a retry is being made.
    pub fn advance(&mut self) {
        self.attempt += 1;
    }
}

/// Outcome of consulting the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Stop,
    Retry { delay: Duration },
}

/// Validated retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    backoff: Backoff,
    statuses: Arc<RetryableStatuses>,
    clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let backoff = config.validate()?;
        let statuses = Arc::new(config.retryable_statuses.clone());
        Ok(Self { config, backoff, statuses, clock })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The status set shared with the error classifier.
    pub fn retryable_statuses(&self) -> Arc<RetryableStatuses> {
        Arc::clone(&self.statuses)
    }

    pub fn should_retry(&self, error: &ErrorRecord, state: &RetryState) -> RetryDecision {
        if !error.retryable() {
            return RetryDecision::Stop;
        }
        if error.status().is_some_and(|s| !self.statuses.contains(s)) {
            return RetryDecision::Stop;
        }
        if !self.config.retryable_methods.contains(&state.method) {
            return RetryDecision::Stop;
        }
        if state.attempt >= self.config.max_retries {
            return RetryDecision::Stop;
        }
        let elapsed = self.clock.now_millis().saturating_sub(state.started_at_millis);
        if u128::from(elapsed) >= self.config.timeout.as_millis() {
            return RetryDecision::Stop;
        }
        let delay = self.config.jitter.apply(self.backoff.delay(state.attempt + 1));
        RetryDecision::Retry { delay }
    }
}
