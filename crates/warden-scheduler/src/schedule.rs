use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::ScheduleSpec;

/// Reject specs whose fields cannot name a real time of day or day of month.
pub fn validate(spec: &ScheduleSpec) -> Result<()> {
    let (hour, minute) = match spec {
        ScheduleSpec::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(SchedulerError::InvalidSchedule(
                    "interval must be at least one second".to_string(),
                ));
            }
            return Ok(());
        }
        ScheduleSpec::Daily { hour, minute } | ScheduleSpec::Weekly { hour, minute, .. } => {
            (*hour, *minute)
        }
        ScheduleSpec::Monthly { day, hour, minute } => {
            if !(1..=31).contains(day) {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "day of month {day} is outside 1-31"
                )));
            }
            (*hour, *minute)
        }
    };
    if hour > 23 || minute > 59 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "{hour:02}:{minute:02} is not a time of day"
        )));
    }
    Ok(())
}

/// Compute the next UTC due time for `spec` strictly *after* `after`.
///
/// `Interval` is `after + period` with no wall-clock alignment. Calendar
/// variants return the first matching wall-clock instant greater than `after`.
/// Out-of-range fields are clamped, so this never fails; [`validate`] is
/// where bad specs get rejected.
pub fn next_occurrence(spec: &ScheduleSpec, after: DateTime<Utc>) -> DateTime<Utc> {
    match spec {
        ScheduleSpec::Interval { every_secs } => {
            after + Duration::seconds((*every_secs).max(1) as i64)
        }

        ScheduleSpec::Daily { hour, minute } => {
            let time = time_of_day(*hour, *minute);
            let today = after.date_naive();
            // Today's slot if it's still ahead, otherwise tomorrow's.
            (0..=1)
                .map(|offset| at(today + Duration::days(offset), time))
                .find(|candidate| *candidate > after)
                .unwrap_or_else(|| at(today + Duration::days(1), time))
        }

        ScheduleSpec::Weekly { day, hour, minute } => {
            let time = time_of_day(*hour, *minute);
            let today = after.date_naive();
            // Eight days covers "today, but the slot already passed".
            (0..=7)
                .map(|offset| today + Duration::days(offset))
                .filter(|date| date.weekday() == *day)
                .map(|date| at(date, time))
                .find(|candidate| *candidate > after)
                .unwrap_or_else(|| at(today + Duration::days(7), time))
        }

        ScheduleSpec::Monthly { day, hour, minute } => {
            let time = time_of_day(*hour, *minute);
            let (mut year, mut month) = (after.year(), after.month());
            // This month's slot, else next month's. Two iterations always suffice
            // because every month has at least 28 days.
            for _ in 0..2 {
                let candidate = at(clamped_date(year, month, *day), time);
                if candidate > after {
                    return candidate;
                }
                (year, month) = next_month(year, month);
            }
            at(clamped_date(year, month, *day), time)
        }
    }
}

/// Where a task with no recorded history should start.
///
/// Calendar schedules take their first slot at or after the start of the
/// current UTC day, so a daily 08:00 task first seen at 08:05 is already
/// overdue and catches up once. Interval schedules are due immediately.
pub fn initial_run_at(spec: &ScheduleSpec, now: DateTime<Utc>) -> DateTime<Utc> {
    match spec {
        ScheduleSpec::Interval { .. } => now,
        _ => {
            let day_start = at(now.date_naive(), NaiveTime::MIN);
            next_occurrence(spec, day_start - Duration::seconds(1))
        }
    }
}

fn time_of_day(hour: u8, minute: u8) -> NaiveTime {
    NaiveTime::from_hms_opt(u32::from(hour.min(23)), u32::from(minute.min(59)), 0)
        .unwrap_or(NaiveTime::MIN)
}

fn at(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    date.and_time(time).and_utc()
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = next_month(year, month);
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn clamped_date(year: i32, month: u32, day: u8) -> NaiveDate {
    let day = u32::from(day.max(1)).min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}
