//! Wall-clock source for lease timestamps.
//!
//! Lease records are compared across tabs, so they are stamped with milliseconds since the Unix
//! epoch rather than a process-local monotonic instant.

/// A source of wall-clock time shared by every tab that reads the same lease records.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
