//! Schedule entry model shared by the store, the index and the dispatcher.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Dispatch status of an entry.
///
/// `Claimed` is transient: it is set when a scheduler instance pops the entry
/// from the ready queue and cleared when the next run is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    Pending,
    Claimed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Claimed => "CLAIMED",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EntryStatus::Pending),
            "CLAIMED" => Ok(EntryStatus::Claimed),
            other => Err(format!("unknown entry status: {other}")),
        }
    }
}

/// Process-wide anchors for weekly and monthly rules.
///
/// Entries only store `weekly` / `monthly`; the weekday and day of month are
/// policy, not per-entry data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarPolicy {
    pub weekly_weekday: Weekday,
    /// 1..=31. Months shorter than this clamp to their last day.
    pub monthly_day: u32,
}

impl Default for CalendarPolicy {
    fn default() -> Self {
        Self {
            weekly_weekday: Weekday::Mon,
            monthly_day: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly { weekday: Weekday },
    Monthly { day: u32 },
}

impl Frequency {
    pub fn parse(raw: &str, policy: &CalendarPolicy) -> Result<Self, ScheduleError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly {
                weekday: policy.weekly_weekday,
            }),
            "monthly" => Ok(Frequency::Monthly {
                day: policy.monthly_day.clamp(1, 31),
            }),
            _ => Err(ScheduleError::UnknownFrequency(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly { .. } => "weekly",
            Frequency::Monthly { .. } => "monthly",
        }
    }
}

/// Parse a local send time stored as `HH:MM` or `HH:MM:SS`.
pub fn parse_send_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    let trimmed = raw.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| ScheduleError::InvalidSendTime(raw.to_string()))
}

pub fn parse_timezone(raw: &str) -> Result<Tz, ScheduleError> {
    raw.trim()
        .parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(raw.to_string()))
}

/// Validated recurrence rule for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleRule {
    pub frequency: Frequency,
    pub send_time: NaiveTime,
    pub timezone: Tz,
}

impl ScheduleRule {
    pub fn parse(
        frequency: &str,
        send_time: &str,
        timezone: &str,
        policy: &CalendarPolicy,
    ) -> Result<Self, ScheduleError> {
        Ok(Self {
            frequency: Frequency::parse(frequency, policy)?,
            send_time: parse_send_time(send_time)?,
            timezone: parse_timezone(timezone)?,
        })
    }
}

/// One recurring email-service configuration as persisted by the store.
///
/// Rule fields are kept raw so a single malformed row surfaces as a
/// [`ScheduleError`] for that entry instead of failing a whole listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub send_time: String,
    pub timezone: String,
    pub frequency: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Written by the downstream job on success, never by the scheduler.
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn rule(&self, policy: &CalendarPolicy) -> Result<ScheduleRule, ScheduleError> {
        ScheduleRule::parse(&self.frequency, &self.send_time, &self.timezone, policy)
    }

    /// `true` while another dispatch of this entry may still be in flight.
    pub fn has_fresh_claim(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.status == EntryStatus::Claimed
            && self.claimed_at.is_some_and(|at| at > now - lease)
    }
}

#[derive(Debug, Clone)]
pub struct NewScheduleEntry {
    pub name: String,
    pub send_time: String,
    pub timezone: String,
    pub frequency: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateScheduleEntry {
    pub name: Option<String>,
    pub send_time: Option<String>,
    pub timezone: Option<String>,
    pub frequency: Option<String>,
    pub is_active: Option<bool>,
}

impl UpdateScheduleEntry {
    /// Whether applying this update can move the entry's next due time.
    pub fn touches_schedule(&self) -> bool {
        self.send_time.is_some()
            || self.timezone.is_some()
            || self.frequency.is_some()
            || self.is_active.is_some()
    }
}
