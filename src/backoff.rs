//! Reconnect delay policy.

use std::time::Duration;

/// First retry delay, and the value restored after a successful connection.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on the retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Growth factor applied after every failed cycle.
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Multiplicative backoff: 5 s, 7.5 s, 11.25 s, … capped at 30 s.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF, BACKOFF_MULTIPLIER)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self { current: initial, initial, max, multiplier }
    }

    /// The delay to wait after this failure; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    /// The delay the next failure would use, without advancing.
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
