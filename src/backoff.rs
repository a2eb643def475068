//! Randomized exponential backoff for store write retries.
//!
//! Attempt `k` waits a whole number of `unit`s drawn uniformly from
//! `[1, 2^(k-1)]`, capped at 256 units. The first attempt never waits.
//!
//! | Attempt | Units |
//! |---------|-------|
//! | 1 | 0 |
//! | 2 | 1 |
//! | 3 | 1..=2 |
//! | 5 | 1..=8 |
//! | 10+ | 1..=256 |

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Upper bound on the number of units a single delay can span.
pub const MAX_BACKOFF_UNITS: u64 = 256;

/// Attempt from which retries are logged as warnings.
pub const WARN_FROM_ATTEMPT: u32 = 5;

/// Retry budget plus the random source for delays.
///
/// With `max_retries = n` a write is attempted at most `n + 1` times.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    unit: Duration,
    max_retries: u32,
    rng: StdRng,
}

impl RetryBackoff {
    /// Creates a backoff with an injected random source.
    pub fn new(unit: Duration, max_retries: u32, rng: StdRng) -> Self {
        Self {
            unit,
            max_retries,
            rng,
        }
    }

    /// Creates a backoff seeded from the operating system.
    pub fn from_entropy(unit: Duration, max_retries: u32) -> Self {
        Self::new(unit, max_retries, StdRng::from_entropy())
    }

    /// A backoff with the same settings and a random source seeded from this one.
    pub fn fork(&mut self) -> Self {
        let seed: u64 = self.rng.gen();
        Self::new(self.unit, self.max_retries, StdRng::seed_from_u64(seed))
    }

    /// Number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `true` while another attempt is allowed after a failed `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay before `attempt` (1-based).
    pub fn delay_for_attempt(&mut self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(8);
        let max_units = (1u64 << exponent).min(MAX_BACKOFF_UNITS);
        let units = self.rng.gen_range(1..=max_units);
        self.unit.saturating_mul(units as u32)
    }
}
