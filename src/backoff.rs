//! Backoff strategies for retry delays.
//!
//! Attempt semantics: attempt index `0` represents the initial call (no delay), and retries
//! start at `attempt = 1`. Retry `n` of an exponential backoff waits
//! `min(base * factor^(n-1), max)`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use lifeline::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(1000), 2.0)
//!     .unwrap()
//!     .with_max(Duration::from_millis(4000))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(1000));
//! assert_eq!(backoff.delay(2), Duration::from_millis(2000));
//! assert_eq!(backoff.delay(3), Duration::from_millis(4000));
//! assert_eq!(backoff.delay(4), Duration::from_millis(4000)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    ConstantDoesNotSupportMax,
    MaxLessThanBase { base: Duration, max: Duration },
    InvalidFactor(f64),
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for exponential backoff")
            }
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
            BackoffError::InvalidFactor(factor) => {
                write!(f, "backoff factor must be finite and >= 1.0 (got {})", factor)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, PartialEq)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { base: Duration, factor: f64, max: Option<Duration> },
}

/// Delay schedule used between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// Exponential growth by `factor` per retry. `factor` must be finite and >= 1.0.
    pub fn exponential(base: Duration, factor: f64) -> Result<Self, BackoffError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(BackoffError::InvalidFactor(factor));
        }
        Ok(Self { kind: BackoffKind::Exponential { base, factor, max: None } })
    }

    /// Cap exponential growth at `max`. Errors on constant backoff or when `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        match &mut self.kind {
            BackoffKind::Exponential { base, max: existing, .. } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Calculate the delay for a given attempt number (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match &self.kind {
            BackoffKind::Constant { delay } => (*delay).min(MAX_BACKOFF),
            BackoffKind::Exponential { base, factor, max } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                let nanos = base.as_nanos() as f64 * factor.powi(exponent);
                let raw = if nanos.is_finite() && nanos < MAX_BACKOFF.as_nanos() as f64 {
                    Duration::from_nanos(nanos.round() as u64)
                } else {
                    MAX_BACKOFF
                };
                let capped = max.map(|m| raw.min(m)).unwrap_or(raw);
                capped.min(MAX_BACKOFF)
            }
        }
    }
}
