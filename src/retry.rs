//! Reconnect pacing for callers.
//!
//! The transport core never reconnects on its own; each `connect()` takes
//! one SRV target off the cursor and failures surface to the caller. A
//! [`RetrySchedule`] gives that caller sane pacing: exponential delays
//! with a cap, an attempt budget, and a reset for once a connection has
//! proven stable.

use std::time::Duration;

pub struct RetrySchedule {
    base: Duration,
    cap: Duration,
    factor: u32,
    max_attempts: u32,
    next_delay: Duration,
    attempts: u32,
}

impl RetrySchedule {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            factor: 2,
            max_attempts: u32::MAX,
            next_delay: base,
            attempts: 0,
        }
    }

    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor;
        self
    }

    /// Caps the number of delays handed out before the schedule runs dry.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The delay to sleep before the next attempt, or `None` once the
    /// attempt budget is spent.
    pub fn next(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.next_delay;
        self.next_delay = (self.next_delay * self.factor).min(self.cap);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to square one; call after a connection survived long enough
    /// to count as stable.
    pub fn reset(&mut self) {
        self.next_delay = self.base;
        self.attempts = 0;
    }
}
