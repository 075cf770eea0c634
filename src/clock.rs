// Injected time source

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

use crate::models::DayIndex;

const SECONDS_PER_DAY: i64 = 86_400;

/// Source of "now" for everything that depends on wall time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current UTC day, used for lazy daily-limit rollover
    fn today(&self) -> DayIndex {
        day_index(self.now())
    }
}

/// Days since the Unix epoch for a timestamp, UTC
pub fn day_index(ts: DateTime<Utc>) -> DayIndex {
    ts.timestamp().div_euclid(SECONDS_PER_DAY)
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// Jump to 00:00:00 UTC of the following day
    pub fn advance_to_next_day(&self) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        let next = (day_index(*now) + 1) * SECONDS_PER_DAY;
        if let Some(ts) = DateTime::from_timestamp(next, 0) {
            *now = ts;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
