//! Exponential backoff for the sync loop

use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            current: initial,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; grows until it reaches the ceiling
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current;
        debug!(
            "Backing off {}ms before sync attempt {}",
            delay.as_millis(),
            self.attempt
        );

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = next.min(self.max);
        delay
    }

    /// Call after a successful sync
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
