//! Retry and backoff utilities
//!
//! Exponential backoff with jitter, bounded either by a deadline or by an
//! attempt count. Jitter spreads retries from concurrent attempts so they
//! do not reconverge on the same instant.

use rand::Rng;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The backoff budget was exhausted before the operation succeeded.
#[derive(Debug, Clone, Copy, Error)]
#[error("retry budget exhausted after {attempts} attempts")]
pub struct RetryExhausted {
    /// Sleeps taken before giving up.
    pub attempts: u32,
}

/// Exponential backoff: `base`, doubling per attempt, capped at `cap`,
/// bounded by an overall deadline and/or a maximum number of sleeps.
#[derive(Debug)]
pub struct ExpDelay {
    base: Duration,
    cap: Duration,
    deadline: Option<Instant>,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl ExpDelay {
    /// Backoff bounded by a deadline measured from now.
    pub fn until(base: Duration, cap: Duration, budget: Duration) -> Self {
        Self {
            base,
            cap,
            deadline: Some(Instant::now() + budget),
            max_attempts: None,
            attempt: 0,
        }
    }

    /// Backoff bounded by a number of sleeps.
    pub fn attempts(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            deadline: None,
            max_attempts: Some(max_attempts),
            attempt: 0,
        }
    }

    /// Sleeps taken so far.
    pub fn taken(&self) -> u32 {
        self.attempt
    }

    /// The next sleep, jittered, without sleeping. Exposed so callers with
    /// their own clock (and tests) can inspect the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(32);
        let raw = self
            .base
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .min(self.cap);
        self.attempt += 1;
        jitter(raw)
    }

    /// Sleep for the next backoff step.
    ///
    /// Returns `Err(RetryExhausted)` once the deadline has passed or the
    /// attempt budget is spent; the caller converts that into its own
    /// timeout error.
    pub fn sleep(&mut self) -> Result<(), RetryExhausted> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return Err(RetryExhausted {
                    attempts: self.attempt,
                });
            }
        }
        let delay = self.next_delay();
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now + delay > deadline {
                return Err(RetryExhausted {
                    attempts: self.attempt,
                });
            }
        }
        std::thread::sleep(delay);
        Ok(())
    }
}

/// Scale a delay by a random factor in [0.75, 1.25].
pub fn jitter(d: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    d.mul_f64(factor)
}
