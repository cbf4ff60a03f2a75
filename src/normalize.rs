//! Canonical date / time-of-day handling.
//!
//! Storage adapters and callers hand times over in several encodings
//! (`"14:00"`, `"14:00:00"`, `"9:00:00"`, a duration since midnight, a
//! `NaiveTime`). All of them collapse to a [`SlotTime`] at minute
//! resolution; seconds are dropped, never rounded.

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::ScheduleError;
use crate::model::SlotTime;

/// Time-of-day as it may arrive from storage or a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeValue {
    Text(String),
    SinceMidnight(Duration),
    Naive(NaiveTime),
}

pub fn normalize_time(value: &TimeValue) -> Result<SlotTime, ScheduleError> {
    match value {
        TimeValue::Text(s) => parse_slot_time(s),
        TimeValue::SinceMidnight(d) => SlotTime::from_duration(*d),
        TimeValue::Naive(t) => Ok(SlotTime::from_naive_time(*t)),
    }
}

impl SlotTime {
    pub fn from_duration(since_midnight: Duration) -> Result<Self, ScheduleError> {
        let minutes = since_midnight.as_secs() / 60;
        u16::try_from(minutes)
            .ok()
            .and_then(SlotTime::from_minutes)
            .ok_or_else(|| ScheduleError::malformed("time of day must be before 24:00"))
    }

    pub fn from_naive_time(t: NaiveTime) -> Self {
        // NaiveTime hour/minute are always in range
        SlotTime::from_hm(t.hour(), t.minute()).unwrap_or(SlotTime::MIDNIGHT)
    }
}

/// Parse `H:MM`, `HH:MM` or `HH:MM:SS`.
pub fn parse_slot_time(s: &str) -> Result<SlotTime, ScheduleError> {
    let s = s.trim();
    let bad = || ScheduleError::malformed(format!("bad time of day: {s:?}"));

    let mut parts = s.split(':');
    let hour = parts.next().ok_or_else(bad)?;
    let minute = parts.next().ok_or_else(bad)?;
    let second = parts.next();
    if parts.next().is_some() {
        return Err(bad());
    }

    if hour.is_empty() || hour.len() > 2 || !all_digits(hour) {
        return Err(bad());
    }
    if minute.len() != 2 || !all_digits(minute) {
        return Err(bad());
    }
    if let Some(sec) = second
        && (sec.len() != 2 || !all_digits(sec) || sec > "59")
    {
        return Err(bad());
    }

    let hour: u32 = hour.parse().map_err(|_| bad())?;
    let minute: u32 = minute.parse().map_err(|_| bad())?;
    if hour >= 24 {
        return Err(ScheduleError::malformed(format!(
            "time of day must be before 24:00, got {s:?}"
        )));
    }
    SlotTime::from_hm(hour, minute).ok_or_else(bad)
}

/// Parse `YYYY-MM-DD`. A full datetime (`T` or space separated) is accepted
/// and its date part kept.
pub fn parse_date(s: &str) -> Result<NaiveDate, ScheduleError> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }
    Err(ScheduleError::malformed(format!("bad date: {s:?}")))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn all_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}
