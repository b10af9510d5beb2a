//! Wall-clock abstraction.
//!
//! Every time read in the admission path goes through a [`Clock`] so that
//! window rollover, blocks and backoff decay can be driven deterministically
//! with [`MockClock`] in tests and in virtual-time simulations.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync + Debug {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so advancing one clone advances
/// all of them.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a mock clock starting at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current = offset(*current, by);
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.current.lock() = at;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

/// `at + by`, saturating at the largest representable instant.
pub fn offset(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time remaining from `now` until `until`, zero if already past.
pub fn until(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now() > t1);
    }

    #[test]
    fn test_mock_clock() {
        let start = Utc::now();
        let clock = MockClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.now(), start + TimeDelta::seconds(10));

        let shared = clock.clone();
        shared.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), start + TimeDelta::seconds(15));

        clock.set(start);
        assert_eq!(shared.now(), start);
    }

    #[test]
    fn test_offset_saturates() {
        let far = offset(DateTime::<Utc>::MAX_UTC, Duration::from_secs(1));
        assert_eq!(far, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_until_never_negative() {
        let now = Utc::now();
        assert_eq!(until(now, now - TimeDelta::seconds(3)), Duration::ZERO);
        assert_eq!(until(now, now + TimeDelta::seconds(3)), Duration::from_secs(3));
    }
}
