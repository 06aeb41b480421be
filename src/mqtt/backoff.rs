use std::time::Duration;

/// Exponential reconnect delay, doubled after every failed attempt.
///
/// Delays never drop below `min` so an unreachable broker is not hammered in
/// a tight loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Returns the delay to wait before the next attempt and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn min(&self) -> Duration {
        self.min
    }
}
