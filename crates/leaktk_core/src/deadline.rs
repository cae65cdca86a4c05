use std::time::{Duration, Instant};

/// A point in time after which an in-flight scan must stop.
///
/// Workers derive one `Deadline` per request and thread it through pattern
/// loads, subprocess waits, HTTP fetches, and fragment iteration. A deadline
/// of [`Deadline::none`] never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

/// Error returned when an operation observes an expired deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out")]
pub struct DeadlineExceeded;

impl Deadline {
    /// A deadline that never expires.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }

    /// A deadline `timeout` from now. A zero timeout means no deadline,
    /// matching the engine's `scan_timeout = 0` convention.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self(None)
        } else {
            Self(Some(Instant::now() + timeout))
        }
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry. `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Errors once the deadline has passed; cheap enough for inner loops.
    pub fn check(&self) -> Result<(), DeadlineExceeded> {
        if self.expired() { Err(DeadlineExceeded) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_expires() {
        let deadline = Deadline::none();
        assert!(!deadline.expired());
        assert!(deadline.remaining().is_none());
        assert!(deadline.check().is_ok());
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        assert_eq!(Deadline::after(Duration::ZERO), Deadline::none());
    }

    #[test]
    fn past_deadline_reports_expired() {
        let deadline = Deadline::after(Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.expired());
        assert!(deadline.check().is_err());
    }

    #[test]
    fn future_deadline_has_remaining_time() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.expired());
        assert!(deadline.remaining().unwrap() > Duration::from_secs(30));
    }
}
