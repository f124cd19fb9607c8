//! Shared provider traits for dependency injection.
//!
//! The tool cache and the offline detector both make decisions based on
//! elapsed time. Abstracting the clock behind a trait lets tests move time
//! forward deterministically instead of sleeping.

use chrono::{DateTime, Utc};

/// Trait for providing timestamps.
///
/// # Example
///
/// ```
/// use stratum::providers::{TimeProvider, SystemTimeProvider};
///
/// let provider = SystemTimeProvider;
/// let now = provider.now();
/// assert!(now.timestamp() > 0);
/// ```
pub trait TimeProvider: Send + Sync {
    /// Returns the current wall-clock time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Default time provider using system time.
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Returns how long ago `then` was relative to `now`.
///
/// A timestamp in the future (clock skew, hand-edited cache file) counts as
/// zero elapsed time rather than an error.
pub fn elapsed_since(now: DateTime<Utc>, then: DateTime<Utc>) -> std::time::Duration {
    (now - then).to_std().unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Clock that only moves when told to.
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                now: Mutex::new(Utc::now()),
            }
        }

        pub fn advance(&self, by: std::time::Duration) {
            let mut now = self.now.lock();
            *now += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl TimeProvider for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_elapsed_since_future_timestamp_is_zero() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);
        assert_eq!(elapsed_since(now, later), Duration::ZERO);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = testing::ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(elapsed_since(clock.now(), start), Duration::from_secs(5));
    }
}
