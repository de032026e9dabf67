//! Exponential backoff shared by the work queues, the operation
//! deduplicator and conflict retries.

use std::time::Duration;

/// `initial * factor^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub const fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// The delay following `current`.
    pub fn next_after(&self, current: Duration) -> Duration {
        if current.is_zero() {
            return self.initial.min(self.max);
        }
        let secs = current.as_secs_f64() * self.factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}
