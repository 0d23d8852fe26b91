//! Time utilities and timing constants for cluster administration.

use chrono::{DateTime, Duration, Utc};

/// Operation timing constants.
pub mod constants {
    use super::Duration;

    /// Upper bound on any single remote call (10 seconds).
    pub fn remote_call_timeout() -> Duration {
        Duration::seconds(10)
    }

    /// How long to wait for a joining member to reach ONLINE (60 seconds).
    pub fn recovery_wait_timeout() -> Duration {
        Duration::seconds(60)
    }

    /// Interval between member state polls while waiting (100 milliseconds).
    pub fn recovery_poll_interval() -> Duration {
        Duration::milliseconds(100)
    }

    /// Default cluster lock duration (60 seconds).
    pub fn default_lock_duration() -> Duration {
        Duration::seconds(60)
    }

    /// Maximum cluster lock duration (5 minutes).
    pub fn max_lock_duration() -> Duration {
        Duration::minutes(5)
    }

    /// Minimum cluster lock duration (5 seconds).
    pub fn min_lock_duration() -> Duration {
        Duration::seconds(5)
    }
}

/// Conversion to the std duration tokio timers expect.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

/// A deadline for a multi-step wait, such as recovery polling.
///
/// A wait too long to represent as a point in time has no deadline at all.
#[derive(Debug, Clone)]
pub struct Deadline {
    /// When the wait gives up.
    pub at: Option<DateTime<Utc>>,
    /// What is being waited for.
    pub operation: String,
}

impl Deadline {
    /// Create a new deadline `duration` from now.
    pub fn new(duration: std::time::Duration, operation: impl Into<String>) -> Self {
        let at = Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        Self {
            at,
            operation: operation.into(),
        }
    }

    /// Check if the deadline has passed.
    pub fn is_exceeded(&self) -> bool {
        self.at.map_or(false, |at| Utc::now() >= at)
    }

    /// Remaining time, zero once exceeded. `None` when unbounded.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.at.map(|at| (at - Utc::now()).as_std())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline() {
        let deadline = Deadline::new(std::time::Duration::from_secs(10), "recovery");
        assert!(!deadline.is_exceeded());
        assert!(deadline.remaining().unwrap() > std::time::Duration::ZERO);

        let passed = Deadline::new(std::time::Duration::ZERO, "recovery");
        assert!(passed.is_exceeded());
        assert_eq!(passed.remaining(), Some(std::time::Duration::ZERO));
    }

    #[test]
    fn test_unrepresentable_deadline_never_expires() {
        let deadline = Deadline::new(std::time::Duration::from_secs(u64::MAX), "recovery");
        assert!(deadline.at.is_none());
        assert!(!deadline.is_exceeded());
        assert_eq!(deadline.remaining(), None);
    }

    #[test]
    fn test_negative_duration_converts_to_zero() {
        assert_eq!(Duration::seconds(-3).as_std(), std::time::Duration::ZERO);
        assert_eq!(Duration::milliseconds(250).as_std(), std::time::Duration::from_millis(250));
    }

    #[test]
    fn test_lock_bounds_ordered() {
        assert!(constants::min_lock_duration() < constants::default_lock_duration());
        assert!(constants::default_lock_duration() < constants::max_lock_duration());
    }
}
