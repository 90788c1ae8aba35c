//! Wall-clock source.
//!
//! Rounds compare deadlines against UTC wall-clock time. The clock never goes
//! backwards: a reading earlier than the previous one is clamped to it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time. Successive calls never decrease.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// System clock, clamped to be non-decreasing.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared handle.
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let now = Utc::now();
        let now = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(now);
        now
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Creates a clock frozen at the current system time.
    pub fn starting_now() -> Arc<Self> {
        Arc::new(Self::new(Utc::now()))
    }

    /// Moves the clock forward. Negative steps are ignored.
    pub fn advance(&self, by: chrono::Duration) {
        if by > chrono::Duration::zero() {
            *self.now.lock() += by;
        }
    }

    /// Moves the clock forward by whole seconds.
    pub fn advance_secs(&self, secs: i64) {
        self.advance(chrono::Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_ignores_backwards() {
        let clock = ManualClock::new(Utc::now());
        let start = clock.now();
        clock.advance_secs(-10);
        assert_eq!(clock.now(), start);
        clock.advance_secs(5);
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }
}
