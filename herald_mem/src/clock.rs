use herald_core::prelude::*;
use tokio::time::Instant;

/// Wall-clock time driven by Tokio's clock.
///
/// The reading starts at the system time of construction and then advances with
/// [`tokio::time::Instant`], so leases age with `tokio::time::pause`/`advance` in tests. Tabs
/// that compare leases should share one instance.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base_millis: i64,
    origin: Instant,
}

impl TokioClock {
    /// Creates a clock anchored at the current system time.
    pub fn new() -> Self {
        Self {
            base_millis: chrono::Utc::now().timestamp_millis(),
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        self.base_millis + self.origin.elapsed().as_millis() as i64
    }
}
