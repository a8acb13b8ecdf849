//! Exponential backoff for reconnect loops.

use std::time::Duration;

/// Grows a delay by `base` on every round, capped at `max` seconds.
///
/// The first [`ExponentialBackoff::wait`] returns immediately so the caller's
/// first attempt is not delayed.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: f64,
    current: f64,
    base: f64,
    max: f64,
    first: bool,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `initial` seconds, multiplying by `base`
    /// every round, saturating at `max` seconds.
    #[must_use]
    pub const fn new(initial: f64, base: f64, max: f64) -> Self {
        Self {
            initial,
            current: initial,
            base,
            max,
            first: true,
        }
    }

    /// The delay the next call to [`Self::wait`] will sleep for.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        if self.first {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((self.current * self.base).min(self.max))
        }
    }

    /// Sleep for the next delay in the sequence.
    pub async fn wait(&mut self) {
        if self.first {
            self.first = false;
            return;
        }
        self.current = (self.current * self.base).min(self.max);
        tokio::time::sleep(Duration::from_secs_f64(self.current)).await;
    }

    /// Restore the initial state after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.first = true;
    }
}
