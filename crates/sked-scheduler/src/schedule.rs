use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Recurrence rule for a recurring task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run again `every_secs` after each completion. The first run is immediate.
    FixedDelay { every_secs: u64 },

    /// Run every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },

    /// Run on a specific weekday (0 = Monday … 6 = Sunday) at the given time (UTC).
    Weekly { day: u8, hour: u8, minute: u8 },
}

impl Schedule {
    pub fn fixed_delay(every: std::time::Duration) -> Self {
        Schedule::FixedDelay {
            every_secs: every.as_secs(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (day, hour, minute) = match *self {
            Schedule::FixedDelay { every_secs } => {
                if every_secs == 0 {
                    return Err(SchedulerError::InvalidSchedule(
                        "fixed delay must be at least one second".into(),
                    ));
                }
                return Ok(());
            }
            Schedule::Daily { hour, minute } => (0, hour, minute),
            Schedule::Weekly { day, hour, minute } => (day, hour, minute),
        };
        if day > 6 || hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidSchedule(format!("{self:?}")));
        }
        Ok(())
    }

    /// When a freshly registered recurring task should first run.
    pub fn initial_execution(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::FixedDelay { .. } => Some(now),
            _ => self.next_execution(now),
        }
    }

    /// The next run strictly after `from`.
    ///
    /// `None` only for a schedule that fails [`Schedule::validate`].
    pub fn next_execution(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Schedule::FixedDelay { every_secs } => {
                Some(from + Duration::seconds(i64::try_from(every_secs).ok()?))
            }

            Schedule::Daily { hour, minute } => {
                let candidate = at_time(from, hour, minute)?;
                if candidate > from {
                    Some(candidate)
                } else {
                    Some(candidate + Duration::days(1))
                }
            }

            Schedule::Weekly { day, hour, minute } => {
                if day > 6 {
                    return None;
                }
                // chrono's num_days_from_monday uses the same numbering
                let today = i64::from(from.weekday().num_days_from_monday());
                let days_ahead = (i64::from(day) - today).rem_euclid(7);
                let candidate = at_time(from + Duration::days(days_ahead), hour, minute)?;
                if candidate > from {
                    Some(candidate)
                } else {
                    Some(candidate + Duration::days(7))
                }
            }
        }
    }
}

fn at_time(day: DateTime<Utc>, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        day.year(),
        day.month(),
        day.day(),
        u32::from(hour),
        u32::from(minute),
        0,
    )
    .single()
}
