use chrono::{NaiveDate, NaiveDateTime};

use crate::model::{ReservationId, SlotTime};

/// Every way a scheduling request can be turned down.
///
/// Rule violations are values, never panics. Only
/// `TransientStorageFailure` is worth retrying unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    MalformedRequest(String),
    PastTime {
        requested: NaiveDateTime,
        now: NaiveDateTime,
    },
    CooldownActive {
        earliest_allowed: NaiveDate,
    },
    SlotConflict {
        date: NaiveDate,
        slot_time: SlotTime,
    },
    SlotNotOffered {
        date: NaiveDate,
        slot_time: SlotTime,
    },
    NotOwner(ReservationId),
    NotFound(ReservationId),
    CancellationTooLate {
        appointment: NaiveDateTime,
        deadline: NaiveDateTime,
    },
    LimitExceeded(&'static str),
    TransientStorageFailure(String),
}

impl ScheduleError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ScheduleError::MalformedRequest(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ScheduleError::TransientStorageFailure(_))
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleError::MalformedRequest(_) => "malformed_request",
            ScheduleError::PastTime { .. } => "past_time",
            ScheduleError::CooldownActive { .. } => "cooldown_active",
            ScheduleError::SlotConflict { .. } => "slot_conflict",
            ScheduleError::SlotNotOffered { .. } => "slot_not_offered",
            ScheduleError::NotOwner(_) => "not_owner",
            ScheduleError::NotFound(_) => "not_found",
            ScheduleError::CancellationTooLate { .. } => "cancellation_too_late",
            ScheduleError::LimitExceeded(_) => "limit_exceeded",
            ScheduleError::TransientStorageFailure(_) => "transient_storage_failure",
        }
    }
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::MalformedRequest(reason) => write!(f, "malformed request: {reason}"),
            ScheduleError::PastTime { requested, now } => write!(
                f,
                "requested time {} is not in the future (now {})",
                requested.format("%Y-%m-%d %H:%M"),
                now.format("%Y-%m-%d %H:%M")
            ),
            ScheduleError::CooldownActive { earliest_allowed } => write!(
                f,
                "cooldown active: next reservation allowed from {}",
                earliest_allowed.format("%Y-%m-%d")
            ),
            ScheduleError::SlotConflict { date, slot_time } => write!(
                f,
                "slot {} {slot_time} is already reserved",
                date.format("%Y-%m-%d")
            ),
            ScheduleError::SlotNotOffered { date, slot_time } => write!(
                f,
                "slot {} {slot_time} is not offered",
                date.format("%Y-%m-%d")
            ),
            ScheduleError::NotOwner(id) => write!(f, "reservation {id} belongs to another client"),
            ScheduleError::NotFound(id) => write!(f, "reservation not found: {id}"),
            ScheduleError::CancellationTooLate {
                appointment,
                deadline,
            } => write!(
                f,
                "too late to cancel the {} appointment: cancellations close at {}",
                appointment.format("%Y-%m-%d %H:%M"),
                deadline.format("%Y-%m-%d %H:%M")
            ),
            ScheduleError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            ScheduleError::TransientStorageFailure(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for ScheduleError {}
