use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A wall-clock instant truncated to a fixed granularity.
///
/// Time slices identify a generation of work: every task and lease row is
/// keyed by one. They are plain values, compared by equality and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeSlice(DateTime<Utc>);

impl TimeSlice {
    /// Truncate `instant` down to the nearest multiple of `granularity`
    /// (measured from the Unix epoch).
    ///
    /// A zero granularity is treated as one millisecond.
    pub fn of(instant: DateTime<Utc>, granularity: Duration) -> Self {
        let step = millis_of(granularity).max(1);
        let millis = instant.timestamp_millis();
        // rem_euclid keeps pre-epoch instants truncating downwards too
        let truncated = millis - millis.rem_euclid(step);
        Self(DateTime::from_timestamp_millis(truncated).unwrap_or(instant))
    }

    /// The slice `interval` after this one. Saturates at the largest
    /// representable instant.
    pub fn plus(self, interval: Duration) -> Self {
        let delta = chrono::Duration::milliseconds(millis_of(interval));
        Self(
            self.0
                .checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }

    /// Epoch milliseconds, the representation used in storage.
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }
}

impl From<TimeSlice> for DateTime<Utc> {
    fn from(slice: TimeSlice) -> Self {
        slice.0
    }
}

impl fmt::Display for TimeSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

pub(crate) fn millis_of(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Source of "now" for the scheduler.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replay tooling.
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.write() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
