//! Retry backoff for failed task attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Exponential backoff doubling from a base delay, bounded by a cap:
/// `delay(n) = min(cap, base * 2^(n - 1))` for attempt number `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay to wait after `attempt` failed. Attempt numbers start at 1;
    /// an attempt of 0 yields no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(63);
        let factor = 1u128 << exponent;
        let delay_ms = (self.base.as_millis()).saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.cap.as_millis()).min(u64::MAX as u128) as u64)
    }

    /// Earliest dispatch time of the next attempt.
    pub fn next_run_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempt);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}
