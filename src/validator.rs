use chrono::{Datelike, Days, NaiveDateTime, Weekday};

use crate::error::ScheduleError;
use crate::limits::*;
use crate::model::*;
use crate::normalize::{parse_date, parse_slot_time};
use crate::registry::RegistryState;

pub const DEFAULT_COOLDOWN_DAYS: u64 = 15;

/// Offered times and open weekdays. When configured, requests off the grid
/// are turned down with `SlotNotOffered`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCalendar {
    pub times: Vec<SlotTime>,
    pub open_days: Vec<Weekday>,
}

impl ServiceCalendar {
    pub fn new(mut times: Vec<SlotTime>, open_days: Vec<Weekday>) -> Self {
        times.sort();
        times.dedup();
        Self { times, open_days }
    }

    pub fn is_open(&self, date: chrono::NaiveDate) -> bool {
        self.open_days.contains(&date.weekday())
    }

    pub fn offers(&self, slot: &Slot) -> bool {
        self.is_open(slot.date) && self.times.binary_search(&slot.time).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct BookingRules {
    pub cooldown_days: u64,
    pub calendar: Option<ServiceCalendar>,
}

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            cooldown_days: DEFAULT_COOLDOWN_DAYS,
            calendar: None,
        }
    }
}

/// Proof that a candidate passed every admission rule against one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    slot: Slot,
}

impl Admission {
    pub fn slot(&self) -> Slot {
        self.slot
    }
}

/// Pure business-rule evaluator. Holds configuration only; time and
/// registry state are passed in per call.
#[derive(Debug, Clone, Default)]
pub struct ReservationValidator {
    rules: BookingRules,
}

impl ReservationValidator {
    pub fn new(rules: BookingRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &BookingRules {
        &self.rules
    }

    /// Well-formedness: parse and trim everything, enforce field limits.
    pub fn normalize(&self, req: &ReservationRequest) -> Result<NewReservation, ScheduleError> {
        let client_id = req.client_id.trim();
        if client_id.is_empty() {
            return Err(ScheduleError::malformed("client id is required"));
        }
        if client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(ScheduleError::malformed("client id too long"));
        }

        let date = parse_date(&req.date)?;
        let time = parse_slot_time(&req.slot_time)?;

        let mut services: Vec<String> = Vec::with_capacity(req.services.len());
        for s in &req.services {
            let s = s.trim();
            if s.is_empty() || services.iter().any(|existing| existing == s) {
                continue;
            }
            if s.len() > MAX_SERVICE_NAME_LEN {
                return Err(ScheduleError::malformed(format!("service name too long: {s:?}")));
            }
            services.push(s.to_string());
        }
        if services.is_empty() {
            return Err(ScheduleError::malformed("at least one service is required"));
        }
        if services.len() > MAX_SERVICES_PER_RESERVATION {
            return Err(ScheduleError::malformed("too many services"));
        }

        let phone = req.phone.trim();
        if phone.is_empty() {
            return Err(ScheduleError::malformed("phone is required"));
        }
        if phone.len() > MAX_PHONE_LEN {
            return Err(ScheduleError::malformed("phone too long"));
        }

        if req.total.trim().is_empty() {
            return Err(ScheduleError::malformed("total is required"));
        }
        let total = Money::parse(&req.total).ok_or_else(|| {
            ScheduleError::malformed(format!("total must be a non-negative amount, got {:?}", req.total))
        })?;
        if total.cents > MAX_TOTAL_CENTS {
            return Err(ScheduleError::malformed("total too large"));
        }

        let contact_email = req.contact_email.trim();
        if contact_email.len() > MAX_EMAIL_LEN {
            return Err(ScheduleError::malformed("contact email too long"));
        }
        if !contact_email.is_empty() && !looks_like_email(contact_email) {
            return Err(ScheduleError::malformed(format!("bad contact email: {contact_email:?}")));
        }

        Ok(NewReservation {
            client_id: ClientId::new(client_id),
            slot: Slot::new(date, time),
            services,
            total,
            phone: phone.to_string(),
            contact_email: contact_email.to_string(),
        })
    }

    /// Admission rules in order; the first failure wins.
    pub fn admit(
        &self,
        candidate: &NewReservation,
        now: NaiveDateTime,
        state: &RegistryState,
    ) -> Result<Admission, ScheduleError> {
        let slot = candidate.slot;

        let horizon = now
            .date()
            .checked_add_days(Days::new(MAX_BOOKING_HORIZON_DAYS));
        if horizon.is_none_or(|h| slot.date > h) {
            return Err(ScheduleError::LimitExceeded("date too far ahead"));
        }

        let requested = slot.starts_at();
        if requested <= now {
            return Err(ScheduleError::PastTime { requested, now });
        }

        if let Some(calendar) = &self.rules.calendar
            && !calendar.offers(&slot)
        {
            return Err(ScheduleError::SlotNotOffered {
                date: slot.date,
                slot_time: slot.time,
            });
        }

        if let Some(recent) = state.most_recent_active_on_or_before(&candidate.client_id, slot.date) {
            let earliest_allowed = recent
                .date()
                .checked_add_days(Days::new(self.rules.cooldown_days))
                .ok_or(ScheduleError::LimitExceeded("cooldown overflows the calendar"))?;
            if slot.date < earliest_allowed {
                return Err(ScheduleError::CooldownActive { earliest_allowed });
            }
        }

        if state.is_occupied(&slot) {
            return Err(ScheduleError::SlotConflict {
                date: slot.date,
                slot_time: slot.time,
            });
        }

        Ok(Admission { slot })
    }
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !s.chars().any(char::is_whitespace)
        }
        None => false,
    }
}
