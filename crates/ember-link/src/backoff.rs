//! Exponential backoff with additive jitter for connection retries.
//!
//! The deterministic floor doubles per consecutive failure up to a
//! configured maximum; a random jitter of at most one base interval is
//! added on top so a fleet of devices does not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt. Each call counts one failure.
    pub fn next_delay(&mut self) -> Duration {
        let floor = self.floor();
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = rand::thread_rng().gen_range(0..=self.base.as_millis() as u64);
        floor + Duration::from_millis(jitter_ms)
    }

    /// The deterministic part of the current delay: base * 2^failures,
    /// capped at the maximum.
    pub fn floor(&self) -> Duration {
        let exp = self.attempt.min(20);
        let uncapped = self
            .base
            .saturating_mul(2u32.saturating_pow(exp));
        uncapped.min(self.max)
    }

    /// Consecutive failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.attempt
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
