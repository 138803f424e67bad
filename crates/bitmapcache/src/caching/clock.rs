use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// The source of time used to track how long bitmaps have been idle.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current point in time.
    fn now(&self) -> Instant;
}

/// A [`Clock`] reading Tokio's time.
///
/// This honors [`tokio::time::pause`], so tests running on paused time get deterministic idle
/// durations that line up with the eviction interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// Creates a clock starting at the current point in time.
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
