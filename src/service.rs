use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::ScheduleError;
use crate::model::*;
use crate::normalize::parse_date;
use crate::notify::{Notification, NotificationDispatcher};
use crate::observability::{CANCELLATIONS_TOTAL, RESERVATIONS_TOTAL};
use crate::policy::CancellationPolicy;
use crate::registry::SlotRegistry;
use crate::validator::ReservationValidator;

/// Entry point for the presentation layer. Composes validation, the
/// registry and notifications; owns no state of its own.
pub struct SchedulingService {
    registry: Arc<SlotRegistry>,
    clock: Arc<dyn Clock>,
    validator: ReservationValidator,
    cancellation: CancellationPolicy,
    notifications: NotificationDispatcher,
    owner_email: Option<String>,
}

impl SchedulingService {
    pub fn new(
        registry: Arc<SlotRegistry>,
        clock: Arc<dyn Clock>,
        validator: ReservationValidator,
        cancellation: CancellationPolicy,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            registry,
            clock,
            validator,
            cancellation,
            notifications,
            owner_email: None,
        }
    }

    /// Address that receives a copy of every booking and cancellation.
    pub fn with_owner_email(mut self, email: Option<String>) -> Self {
        self.owner_email = email.filter(|e| !e.trim().is_empty());
        self
    }

    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    pub async fn request_reservation(
        &self,
        req: ReservationRequest,
    ) -> Result<ReservationId, ScheduleError> {
        let result = self.admit_and_reserve(&req).await;
        let outcome = match &result {
            Ok(_) => "admitted",
            Err(e) => e.kind(),
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);

        let reservation = result.inspect_err(|e| {
            debug!("reservation for {:?} on {} {} rejected: {e}", req.client_id, req.date, req.slot_time)
        })?;
        info!(
            "reservation {} booked: {} by {}",
            reservation.id, reservation.slot, reservation.client_id
        );

        if !reservation.contact_email.is_empty() {
            self.notifications
                .dispatch(Notification::confirmed(&reservation.contact_email, &reservation));
        }
        if let Some(owner) = &self.owner_email {
            self.notifications
                .dispatch(Notification::new_booking(owner, &reservation));
        }
        Ok(reservation.id)
    }

    async fn admit_and_reserve(&self, req: &ReservationRequest) -> Result<Reservation, ScheduleError> {
        let candidate = self.validator.normalize(req)?;
        let now = self.clock.now();

        // Cheap rejection on a read snapshot; the write path checks again.
        self.registry
            .read(|state| self.validator.admit(&candidate, now, state))
            .await?;

        self.registry
            .reserve_with(candidate.clone(), now, |state| {
                self.validator.admit(&candidate, now, state).map(|_| ())
            })
            .await
    }

    /// Cancel on behalf of `requester`, subject to ownership and lead time.
    pub async fn cancel_reservation(
        &self,
        id: ReservationId,
        requester: &ClientId,
    ) -> Result<(), ScheduleError> {
        let now = self.clock.now();
        let result = self
            .registry
            .cancel_with(id, requester, now, |r| self.cancellation.check(r, requester, now))
            .await;
        let outcome = match &result {
            Ok(_) => "cancelled",
            Err(e) => e.kind(),
        };
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => outcome).increment(1);

        let reservation = result.inspect_err(|e| debug!("cancel of {id} by {requester} rejected: {e}"))?;
        info!("reservation {id} cancelled by {requester}, {} is free", reservation.slot);

        if !reservation.contact_email.is_empty() {
            self.notifications
                .dispatch(Notification::cancelled(&reservation.contact_email, &reservation));
        }
        if let Some(owner) = &self.owner_email {
            self.notifications
                .dispatch(Notification::cancelled(owner, &reservation));
        }
        Ok(())
    }

    pub async fn occupied_slots(&self) -> BTreeMap<NaiveDate, BTreeSet<SlotTime>> {
        self.registry.all_occupied().await
    }

    /// Occupied `HH:MM` times on `date`, ascending.
    pub async fn occupied_times_on(&self, date: &str) -> Result<Vec<String>, ScheduleError> {
        let date = parse_date(date)?;
        Ok(self
            .registry
            .occupied_on(date)
            .await
            .into_iter()
            .map(|t| t.to_string())
            .collect())
    }

    /// The client's history, newest first, cancelled ones included.
    pub async fn reservations_for_client(&self, client: &ClientId) -> Vec<Reservation> {
        self.registry.list_by_client(client).await
    }

    /// Single reservation, visible to its owner only.
    pub async fn reservation(
        &self,
        id: ReservationId,
        requester: &ClientId,
    ) -> Result<Reservation, ScheduleError> {
        let r = self
            .registry
            .get(id)
            .await
            .ok_or(ScheduleError::NotFound(id))?;
        if r.client_id != *requester {
            return Err(ScheduleError::NotOwner(id));
        }
        Ok(r)
    }

    /// Offered times on `date` that are neither taken nor already past.
    pub async fn available_times_on(&self, date: &str) -> Result<Vec<String>, ScheduleError> {
        let Some(calendar) = &self.validator.rules().calendar else {
            return Err(ScheduleError::malformed("no service calendar configured"));
        };
        let date = parse_date(date)?;
        if !calendar.is_open(date) {
            return Ok(Vec::new());
        }
        let taken: BTreeSet<SlotTime> = self.registry.occupied_on(date).await.into_iter().collect();
        let now = self.clock.now();
        Ok(calendar
            .times
            .iter()
            .filter(|t| !taken.contains(t))
            .filter(|t| Slot::new(date, **t).starts_at() > now)
            .map(|t| t.to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDateTime, Weekday};

    use super::*;
    use crate::clock::FixedClock;
    use crate::notify::LogNotifier;
    use crate::registry::DEFAULT_STORAGE_TIMEOUT;
    use crate::validator::{BookingRules, ServiceCalendar};

    fn wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("chairbook_test_service");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn service(name: &str, rules: BookingRules, clock: Arc<FixedClock>) -> SchedulingService {
        let registry = Arc::new(SlotRegistry::open(wal_path(name), DEFAULT_STORAGE_TIMEOUT).unwrap());
        let (notifications, _) = NotificationDispatcher::spawn(Arc::new(LogNotifier));
        SchedulingService::new(
            registry,
            clock,
            ReservationValidator::new(rules),
            CancellationPolicy::default(),
            notifications,
        )
    }

    fn request(client: &str, date: &str, time: &str) -> ReservationRequest {
        ReservationRequest {
            client_id: client.into(),
            date: date.into(),
            slot_time: time.into(),
            services: vec!["corte".into()],
            total: "50.00".into(),
            phone: "(11) 91234-5678".into(),
            contact_email: format!("{client}@example.com"),
        }
    }

    #[tokio::test]
    async fn book_list_and_cancel() {
        let clock = Arc::new(FixedClock::new(at(2025, 3, 1, 9, 0)));
        let svc = service("book_list_cancel.wal", BookingRules::default(), clock);

        let id = svc
            .request_reservation(request("ana", "2025-03-10", "14:00:00"))
            .await
            .unwrap();
        assert_eq!(
            svc.occupied_times_on("2025-03-10").await.unwrap(),
            vec!["14:00".to_string()]
        );
        let mine = svc.reservations_for_client(&ClientId::new("ana")).await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].slot_time().to_string(), "14:00");

        assert_eq!(
            svc.reservation(id, &ClientId::new("bia")).await,
            Err(ScheduleError::NotOwner(id))
        );
        svc.cancel_reservation(id, &ClientId::new("ana")).await.unwrap();
        assert!(svc.occupied_slots().await.is_empty());
        assert_eq!(
            svc.reservation(id, &ClientId::new("ana")).await.unwrap().status,
            ReservationStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn malformed_date_is_rejected_on_reads() {
        let clock = Arc::new(FixedClock::new(at(2025, 3, 1, 9, 0)));
        let svc = service("malformed_read.wal", BookingRules::default(), clock);
        assert!(matches!(
            svc.occupied_times_on("10/03/2025").await,
            Err(ScheduleError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn available_times_follow_calendar_and_clock() {
        let clock = Arc::new(FixedClock::new(at(2025, 3, 11, 10, 30)));
        let calendar = ServiceCalendar::new(
            ["09:00", "10:00", "11:00", "14:00"]
                .iter()
                .map(|s| crate::normalize::parse_slot_time(s).unwrap())
                .collect(),
            vec![Weekday::Tue, Weekday::Wed],
        );
        let rules = BookingRules {
            calendar: Some(calendar),
            ..Default::default()
        };
        let svc = service("available_times.wal", rules, clock.clone());

        svc.request_reservation(request("ana", "2025-03-11", "14:00"))
            .await
            .unwrap();
        // 2025-03-11 is a Tuesday; 09:00 and 10:00 are already past.
        assert_eq!(svc.available_times_on("2025-03-11").await.unwrap(), vec!["11:00"]);
        assert!(svc.available_times_on("2025-03-13").await.unwrap().is_empty());

        clock.advance(Duration::days(1));
        assert_eq!(svc.available_times_on("2025-03-12").await.unwrap().len(), 2);

        let err = svc
            .request_reservation(request("bia", "2025-03-12", "12:00"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "slot_not_offered");
    }

    #[tokio::test]
    async fn available_times_need_a_calendar() {
        let clock = Arc::new(FixedClock::new(at(2025, 3, 1, 9, 0)));
        let svc = service("no_calendar.wal", BookingRules::default(), clock);
        assert!(matches!(
            svc.available_times_on("2025-03-11").await,
            Err(ScheduleError::MalformedRequest(_))
        ));
    }
}
