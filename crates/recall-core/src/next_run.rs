//! Next-run calculation for daily, weekly and monthly rules.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::schedule::{Frequency, ScheduleRule};

const GAP_STEP_MINUTES: i64 = 15;
/// Enough 15-minute steps to cross a full skipped calendar day.
const MAX_GAP_STEPS: u32 = 25 * 4;

/// Compute the first occurrence of `rule` strictly after `reference`.
///
/// The local send time is resolved against the timezone offset in force on
/// the candidate date, so DST transitions between `reference` and the result
/// are handled. Ambiguous local times (fall-back) resolve to the earlier
/// instant; non-existent ones (spring-forward) move forward to the first
/// valid local time.
pub fn calculate_next_run(rule: &ScheduleRule, reference: DateTime<Utc>) -> DateTime<Utc> {
    let tz = rule.timezone;
    let local_date = reference.with_timezone(&tz).date_naive();

    match rule.frequency {
        Frequency::Daily => {
            let mut date = local_date;
            loop {
                let candidate = resolve_local(&tz, date.and_time(rule.send_time));
                if candidate > reference {
                    return candidate;
                }
                date += Duration::days(1);
            }
        }
        Frequency::Weekly { weekday } => {
            let ahead = (weekday.num_days_from_monday() + 7
                - local_date.weekday().num_days_from_monday())
                % 7;
            let mut date = local_date + Duration::days(i64::from(ahead));
            loop {
                let candidate = resolve_local(&tz, date.and_time(rule.send_time));
                if candidate > reference {
                    return candidate;
                }
                date += Duration::days(7);
            }
        }
        Frequency::Monthly { day } => {
            let (mut year, mut month) = (local_date.year(), local_date.month());
            loop {
                if let Some(date) = clamped_day(year, month, day) {
                    let candidate = resolve_local(&tz, date.and_time(rule.send_time));
                    if candidate > reference {
                        return candidate;
                    }
                }
                (year, month) = next_month(year, month);
            }
        }
    }
}

fn resolve_local(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = local;
    for _ in 0..=MAX_GAP_STEPS {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => candidate += Duration::minutes(GAP_STEP_MINUTES),
        }
    }
    Utc.from_utc_datetime(&local)
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = next_month(year, month);
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// `day` in the given month, clamped to the month's last day.
fn clamped_day(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day.min(last_day_of_month(year, month)))
}
