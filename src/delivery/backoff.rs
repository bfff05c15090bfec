//! Linear retry policy
//!
//! The n-th consecutive failure of the same message waits `n * unit`
//! before the next attempt. With `max_retries == 0` the policy never gives
//! up; otherwise it yields `None` once `max_retries` retries have failed.

use std::time::Duration;

use backoff::backoff::Backoff;

/// Linear backoff: `unit`, `2 * unit`, `3 * unit`, ...
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    unit: Duration,
    max_retries: u32,
    retries: u32,
}

impl LinearBackoff {
    /// Create a policy. `max_retries == 0` retries forever.
    pub fn new(unit: Duration, max_retries: u32) -> Self {
        Self {
            unit,
            max_retries,
            retries: 0,
        }
    }

    /// Consecutive failures recorded since the last reset
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether this policy ever gives up
    pub fn is_bounded(&self) -> bool {
        self.max_retries > 0
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.retries = self.retries.saturating_add(1);

        if self.is_bounded() && self.retries > self.max_retries {
            return None;
        }

        Some(self.unit.saturating_mul(self.retries))
    }
}
