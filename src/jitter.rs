//! Jitter strategies applied on top of the backoff delay.
//!
//! - `None`: exact backoff delay. The default, and what the retry tests rely on.
//! - `Full`: uniform in `[0, delay]`, spreads a burst of clients hitting the same outage.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor while adding randomness.
//!
//! RNG: `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`.

use rand::{rng, Rng};
use serde::Deserialize;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    #[default]
    None,
    Full,
    Equal,
}

impl Jitter {
    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-supplied RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis: u64 = delay.as_millis().try_into().unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            Jitter::Full if millis == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal if millis == 0 => Duration::ZERO,
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}
