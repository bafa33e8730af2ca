//! Clock abstractions used by the in-memory store and for reset hints.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe wall-clock time source.
///
/// The origin is the UNIX epoch and the return value is seconds with
/// sub-second precision. Calls must be safe concurrently (`Send + Sync`).
/// The distributed store never consults this clock for its own arithmetic;
/// only the in-memory backend and display-level reset hints do.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time as float seconds since the UNIX epoch.
    fn now_secs(&self) -> f64;
}

/// System wall clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    /// Returns seconds since the UNIX epoch. A clock set before 1970
    /// saturates to zero rather than panicking.
    fn now_secs(&self) -> f64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same underlying reading, so a clock handed to a store
/// can be advanced from the test body.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock reading zero seconds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock with an explicit starting reading.
    pub fn starting_at(secs: f64) -> Self {
        Self { now: Arc::new(Mutex::new(secs)) }
    }

    /// Set the absolute reading.
    pub fn set(&self, secs: f64) {
        *self.now.lock().unwrap() = secs;
    }

    /// Advance the reading by `secs` (may be negative to simulate regression).
    pub fn advance(&self, secs: f64) {
        *self.now.lock().unwrap() += secs;
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        *self.now.lock().unwrap()
    }
}
