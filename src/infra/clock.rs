//! Injected time source
//!
//! "Now" and "today" are always taken from a `Clock` handed to the engine,
//! never read ambiently, so day scoping is deterministic under test.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Calendar day of `at` in the site's fixed offset
pub fn local_date(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}

/// First instant of the calendar day containing `at`, in the site's offset
pub fn start_of_day(at: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let midnight = local_date(at, offset).and_hms_opt(0, 0, 0).unwrap_or_default();
    // Fixed offsets have no gaps, so this mapping is always single.
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(at)
}

/// Parse a UTC offset in minutes, clamped to the valid ±23:59 range
pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
    let seconds = minutes.clamp(-1439, 1439) * 60;
    FixedOffset::east_opt(seconds).unwrap_or_else(|| Utc.fix())
}
