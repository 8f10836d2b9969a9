//! Exponential backoff for streaming reconnect attempts.

use std::time::Duration;

/// Capped exponential backoff. Each call to [`Backoff::next_delay`] doubles
/// the previous delay until the cap is reached; [`Backoff::reset`] restarts
/// the schedule from the base delay.
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

    /// Returns the delay for the current attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        // 2^shift overflows Duration math long before 32; the cap kicks in
        // way earlier for any realistic configuration.
        let shift = self.attempt.min(20);
        let delay = self.base.saturating_mul(1u32 << shift).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Restarts the schedule from the base delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
