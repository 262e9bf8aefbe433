//! Injectable time source
//!
//! Page statistics are kept with minute precision and lock waits are bounded
//! in milliseconds. Both read time through [`Clock`] so tests can drive it.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;

    /// Whole minutes since the Unix epoch
    fn now_minutes(&self) -> i64 {
        self.now_millis() / 60_000
    }
}

/// Wall clock backed by chrono
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `millis`
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    /// Create a clock frozen at the start of `minutes`
    pub fn at_minutes(minutes: i64) -> Self {
        Self::new(minutes * 60_000)
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn set_minutes(&self, minutes: i64) {
        self.set_millis(minutes * 60_000);
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.millis.fetch_add(minutes * 60_000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_minutes() {
        let clock = ManualClock::at_minutes(10);
        assert_eq!(clock.now_minutes(), 10);

        clock.advance_minutes(5);
        assert_eq!(clock.now_minutes(), 15);
        assert_eq!(clock.now_millis(), 15 * 60_000);

        clock.set_millis(59_999);
        assert_eq!(clock.now_minutes(), 0);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        let clock = SystemClock;
        // 2020-01-01T00:00:00Z
        assert!(clock.now_millis() > 1_577_836_800_000);
        assert!(clock.now_minutes() > 26_297_280);
    }
}
