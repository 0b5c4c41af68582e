use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{DurableJobError, Result};

/// Computes when the next occurrence of a job should execute.
///
/// Implementations must be pure in `clock.now()` and must only ever return
/// instants strictly after it. `None` means there is no further occurrence.
pub trait ExecutionTimeResolver: Send + Sync {
    fn resolve_execution_time(&self, clock: &dyn Clock) -> Option<DateTime<Utc>>;
}

impl<F> ExecutionTimeResolver for F
where
    F: Fn(&dyn Clock) -> Option<DateTime<Utc>> + Send + Sync,
{
    fn resolve_execution_time(&self, clock: &dyn Clock) -> Option<DateTime<Utc>> {
        self(clock)
    }
}

/// Built-in recurrence rules. All times are UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Every week on `day` at `time`.
    WeeklyAt { day: Weekday, time: NaiveTime },

    /// Every month on `day` (1..=31) at `time`. Months shorter than `day`
    /// fire on their last day.
    MonthlyAt { day: u32, time: NaiveTime },

    /// Every day at `time`.
    NightlyAt { time: NaiveTime },

    /// Once, at an absolute instant.
    FixedDate { at: DateTime<Utc> },
}

impl Schedule {
    pub fn weekly_at(day: Weekday, hour: u32, minute: u32) -> Result<Self> {
        Ok(Schedule::WeeklyAt {
            day,
            time: time_of_day(hour, minute)?,
        })
    }

    pub fn monthly_at(day: u32, hour: u32, minute: u32) -> Result<Self> {
        let schedule = Schedule::MonthlyAt {
            day,
            time: time_of_day(hour, minute)?,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn nightly_at(hour: u32, minute: u32) -> Result<Self> {
        Ok(Schedule::NightlyAt {
            time: time_of_day(hour, minute)?,
        })
    }

    pub fn fixed_date(at: DateTime<Utc>) -> Self {
        Schedule::FixedDate { at }
    }

    /// Reject definitions that can never produce an occurrence.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::MonthlyAt { day, .. } if !(1..=31).contains(day) => Err(
                DurableJobError::InvalidSchedule(format!("day of month out of range: {day}")),
            ),
            _ => Ok(()),
        }
    }
}

impl ExecutionTimeResolver for Schedule {
    fn resolve_execution_time(&self, clock: &dyn Clock) -> Option<DateTime<Utc>> {
        compute_next_run(self, clock.now())
    }
}

/// Compute the next UTC execution time for `schedule` strictly *after* `from`.
///
/// Returns `None` when the schedule is exhausted (a `FixedDate` whose instant
/// is not in the future) or invalid.
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::FixedDate { at } => (*at > from).then_some(*at),

        Schedule::NightlyAt { time } => {
            let candidate = from.date_naive().and_time(*time).and_utc();
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(1))
            }
        }

        Schedule::WeeklyAt { day, time } => {
            let today = from.weekday().num_days_from_monday() as i64;
            let target = day.num_days_from_monday() as i64;
            let days_ahead = (target - today).rem_euclid(7);

            let candidate = (from.date_naive() + Duration::days(days_ahead))
                .and_time(*time)
                .and_utc();
            if candidate > from {
                Some(candidate)
            } else {
                // Target weekday is today and the time has passed.
                Some(candidate + Duration::days(7))
            }
        }

        Schedule::MonthlyAt { day, time } => {
            if !(1..=31).contains(day) {
                return None;
            }
            let this_month = clamped_month_day(from.year(), from.month(), *day)?
                .and_time(*time)
                .and_utc();
            if this_month > from {
                return Some(this_month);
            }
            let (year, month) = if from.month() == 12 {
                (from.year() + 1, 1)
            } else {
                (from.year(), from.month() + 1)
            };
            Some(
                clamped_month_day(year, month, *day)?
                    .and_time(*time)
                    .and_utc(),
            )
        }
    }
}

fn time_of_day(hour: u32, minute: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| DurableJobError::InvalidSchedule(format!("invalid time {hour}:{minute}")))
}

/// `day` of the given month, or the month's last day if it is shorter.
fn clamped_month_day(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last_day = first_of_next.pred_opt()?.day();
    NaiveDate::from_ymd_opt(year, month, day.min(last_day))
}
