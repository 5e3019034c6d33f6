use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::{millis_of, TimeSlice};

const MINUTE: Duration = Duration::from_secs(60);

/// Defines when a task first fires and whether it fires again.
///
/// The first firing of a repeating trigger is `now + delay`; every later
/// firing is `previous slice + interval`. The two formulas are intentionally
/// different: a task created with a long delay and a short interval fires
/// late once and then keeps the short cadence from that point on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire exactly once, in the slice containing `at`.
    OneShot { at: DateTime<Utc> },

    /// Fire after `delay`, then every `interval`.
    Repeating { delay: Duration, interval: Duration },
}

impl Trigger {
    pub fn one_shot(at: DateTime<Utc>) -> Self {
        Trigger::OneShot { at }
    }

    /// Repeating trigger with no initial delay.
    pub fn repeating(interval: Duration) -> Self {
        Trigger::Repeating {
            delay: Duration::ZERO,
            interval,
        }
    }

    /// Set the initial delay. No effect on one-shot triggers.
    pub fn with_delay(self, delay: Duration) -> Self {
        match self {
            Trigger::Repeating { interval, .. } => Trigger::Repeating { delay, interval },
            one_shot => one_shot,
        }
    }

    /// Recurrence interval; zero for one-shot triggers.
    pub fn interval(&self) -> Duration {
        match self {
            Trigger::OneShot { .. } => Duration::ZERO,
            Trigger::Repeating { interval, .. } => *interval,
        }
    }

    /// Intervals are persisted in whole minutes, so anything else cannot be
    /// honoured after the first firing.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Trigger::OneShot { .. } => Ok(()),
            Trigger::Repeating { interval, .. } => {
                if interval.is_zero() {
                    return Err("repeating trigger needs a non-zero interval".to_string());
                }
                if interval.as_millis() % MINUTE.as_millis() != 0 {
                    return Err(format!(
                        "repeating interval {interval:?} is not a whole number of minutes"
                    ));
                }
                Ok(())
            }
        }
    }

    /// Slice of the first firing.
    pub fn first_slice(&self, now: DateTime<Utc>, granularity: Duration) -> TimeSlice {
        match self {
            Trigger::OneShot { at } => TimeSlice::of(*at, granularity),
            Trigger::Repeating { delay, .. } => {
                let delay = chrono::Duration::milliseconds(millis_of(*delay));
                let first = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
                TimeSlice::of(first, granularity)
            }
        }
    }

    /// Slice of the firing after `previous`, or `None` when exhausted.
    pub fn next_slice(&self, previous: TimeSlice) -> Option<TimeSlice> {
        match self {
            Trigger::OneShot { .. } => None,
            Trigger::Repeating { interval, .. } => Some(previous.plus(*interval)),
        }
    }
}
