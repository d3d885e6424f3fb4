//! Wall-clock abstraction.
//!
//! All persisted timestamps (`mtime`, `creation_time`,
//! `state_change_time`, ...) come from a [`Clock`] so tests can inject
//! a fixed or stepped time source.  The production clock never goes
//! backwards even if the system clock does.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch, as stored in INTEGER columns.
pub type DbTime = i64;

/// Monotonically non-decreasing wall clock.
pub trait Clock: Send + Sync {
    /// Current time in microseconds since the Unix epoch.
    fn now(&self) -> DbTime;
}

/// Production clock backed by the system time, clamped so consecutive
/// reads never decrease.
#[derive(Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DbTime {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        // fetch_max both stores and returns the previous maximum
        let prev = self.last.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }
}

/// Fixed clock for tests; time only moves when told to.
#[derive(Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(start: DbTime) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, micros: i64) {
        self.now.fetch_add(micros, Ordering::AcqRel);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DbTime {
        self.now.load(Ordering::Acquire)
    }
}
