use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Time source for play-time accounting.
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary origin.
    fn elapsed(&self) -> Duration;

    /// Wall-clock seconds since the Unix epoch, written to `__last_played`.
    fn wall_secs(&self) -> f64;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall_secs(&self) -> f64 {
        common::now_secs()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    inner: Mutex<(Duration, f64)>,
}

impl ManualClock {
    pub fn new(wall_secs: f64) -> Self {
        Self {
            inner: Mutex::new((Duration::ZERO, wall_secs)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.0 += by;
        inner.1 += by.as_secs_f64();
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.inner.lock().0
    }

    fn wall_secs(&self) -> f64 {
        self.inner.lock().1
    }
}
