use chrono::{Duration, NaiveDateTime};

use crate::error::ScheduleError;
use crate::model::{ClientId, Reservation};

pub const DEFAULT_CANCEL_LEAD_MINUTES: i64 = 120;

/// Upper bound accepted from configuration: one leap year.
pub const MAX_CANCEL_LEAD_MINUTES: i64 = 366 * 24 * 60;

/// Gate in front of `SlotRegistry::cancel`: owner only, and only while at
/// least `min_lead_time` remains before the appointment.
#[derive(Debug, Clone, Copy)]
pub struct CancellationPolicy {
    min_lead_time: Duration,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_CANCEL_LEAD_MINUTES))
    }
}

impl CancellationPolicy {
    pub fn new(min_lead_time: Duration) -> Self {
        Self { min_lead_time }
    }

    /// Last instant at which `reservation` may still be cancelled. Clamps to
    /// the earliest representable instant when the lead time reaches past it.
    pub fn deadline(&self, reservation: &Reservation) -> NaiveDateTime {
        reservation
            .slot
            .starts_at()
            .checked_sub_signed(self.min_lead_time)
            .unwrap_or(NaiveDateTime::MIN)
    }

    pub fn check(
        &self,
        reservation: &Reservation,
        requester: &ClientId,
        now: NaiveDateTime,
    ) -> Result<(), ScheduleError> {
        if reservation.client_id != *requester {
            return Err(ScheduleError::NotOwner(reservation.id));
        }
        let appointment = reservation.slot.starts_at();
        if appointment - now < self.min_lead_time {
            return Err(ScheduleError::CancellationTooLate {
                appointment,
                deadline: self.deadline(reservation),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::model::*;

    fn reservation() -> Reservation {
        let day = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        Reservation {
            id: ReservationId(1),
            client_id: ClientId::new("ana"),
            slot: Slot::new(day, SlotTime::from_hm(14, 0).unwrap()),
            services: vec!["corte".into()],
            total: Money::from_cents(5000),
            phone: "1".into(),
            contact_email: String::new(),
            status: ReservationStatus::Active,
            created_at: day.and_hms_opt(8, 0, 0).unwrap(),
            cancelled_at: None,
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn owner_outside_lead_time_may_cancel() {
        let policy = CancellationPolicy::default();
        assert!(policy.check(&reservation(), &ClientId::new("ana"), at(9, 0)).is_ok());
    }

    #[test]
    fn exactly_at_threshold_is_allowed() {
        let policy = CancellationPolicy::default();
        assert!(policy.check(&reservation(), &ClientId::new("ana"), at(12, 0)).is_ok());
    }

    #[test]
    fn inside_lead_time_is_too_late() {
        let policy = CancellationPolicy::default();
        let err = policy
            .check(&reservation(), &ClientId::new("ana"), at(13, 0))
            .unwrap_err();
        assert_eq!(
            err,
            ScheduleError::CancellationTooLate {
                appointment: at(14, 0),
                deadline: at(12, 0),
            }
        );
        assert!(policy.check(&reservation(), &ClientId::new("ana"), at(12, 1)).is_err());
    }

    #[test]
    fn ownership_is_checked_first() {
        let policy = CancellationPolicy::default();
        assert_eq!(
            policy.check(&reservation(), &ClientId::new("bia"), at(13, 59)),
            Err(ScheduleError::NotOwner(ReservationId(1)))
        );
    }

    #[test]
    fn huge_lead_time_is_too_late_not_a_panic() {
        let policy = CancellationPolicy::new(Duration::days(200_000_000));
        match policy.check(&reservation(), &ClientId::new("ana"), at(9, 0)) {
            Err(ScheduleError::CancellationTooLate { deadline, .. }) => {
                assert_eq!(deadline, NaiveDateTime::MIN);
            }
            other => panic!("expected CancellationTooLate, got {other:?}"),
        }
    }

    #[test]
    fn lead_time_is_configurable() {
        let policy = CancellationPolicy::new(Duration::hours(24));
        assert!(policy.check(&reservation(), &ClientId::new("ana"), at(9, 0)).is_err());
        let day_before = NaiveDate::from_ymd_opt(2025, 3, 9)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap();
        assert!(policy.check(&reservation(), &ClientId::new("ana"), day_before).is_ok());
    }
}
