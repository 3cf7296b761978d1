//! Debounce, backoff and cooldown arithmetic.
//!
//! Pure functions of "last trigger time" and "interval" so the timer logic
//! lives in one place and can be tested without a runtime. Instants are
//! `tokio::time::Instant` so paused-clock tests drive them.

use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff for transient refresh failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (3 retries = 4 attempts).
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base, 2*base, 4*base...
    ///
    /// Strictly increasing in `retry` for any non-zero base delay.
    pub fn delay_for(&self, retry: u32) -> Duration {
        // 2^20 * base is already far beyond any useful retry delay
        let factor = 1u32 << retry.min(20);
        self.base_delay.saturating_mul(factor)
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Check if `interval` has passed since `last` (or there never was a `last`).
pub fn cooldown_elapsed(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        Some(last) => now.saturating_duration_since(last) >= interval,
        None => true,
    }
}

/// Trailing-edge debounce: fire once `interval` has passed since the most
/// recent trigger with no further trigger in between.
pub fn debounce_elapsed(last_trigger: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last_trigger {
        Some(last) => now.saturating_duration_since(last) >= interval,
        None => false,
    }
}

/// Stateful wrapper around [`debounce_elapsed`] collapsing bursts of triggers
/// into one firing.
#[derive(Debug, Clone)]
pub struct Debouncer {
    interval: Duration,
    last_trigger: Option<Instant>,
    collapsed: u32,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_trigger: None,
            collapsed: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a trigger; restarts the window.
    pub fn trigger(&mut self, now: Instant) {
        if self.last_trigger.is_some() {
            self.collapsed = self.collapsed.saturating_add(1);
        }
        self.last_trigger = Some(now);
    }

    /// When the pending window closes, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.last_trigger.map(|t| t + self.interval)
    }

    /// If the window has closed, consume it and return how many extra
    /// triggers were collapsed into this firing.
    pub fn fire(&mut self, now: Instant) -> Option<u32> {
        if debounce_elapsed(self.last_trigger, self.interval, now) {
            self.last_trigger = None;
            Some(std::mem::take(&mut self.collapsed))
        } else {
            None
        }
    }
}
