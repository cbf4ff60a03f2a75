use chrono::NaiveDateTime;

use crate::error::ScheduleError;
use crate::limits::MAX_RESERVATIONS;
use crate::model::*;

use super::{RegistryState, SlotRegistry};

impl SlotRegistry {
    /// Insert `new` if its slot is free. Fails with `SlotConflict` otherwise.
    pub async fn reserve(
        &self,
        new: NewReservation,
        created_at: NaiveDateTime,
    ) -> Result<Reservation, ScheduleError> {
        self.reserve_with(new, created_at, |_| Ok(())).await
    }

    /// Like [`reserve`](Self::reserve), but runs `admit` against the state
    /// under the write lock first. Whatever `admit` checks still holds when
    /// the insert lands.
    pub async fn reserve_with<F>(
        &self,
        new: NewReservation,
        created_at: NaiveDateTime,
        admit: F,
    ) -> Result<Reservation, ScheduleError>
    where
        F: FnOnce(&RegistryState) -> Result<(), ScheduleError>,
    {
        let mut state = self.state.write().await;
        admit(&*state)?;

        if state.is_occupied(&new.slot) {
            return Err(ScheduleError::SlotConflict {
                date: new.slot.date,
                slot_time: new.slot.time,
            });
        }
        if state.len() >= MAX_RESERVATIONS {
            return Err(ScheduleError::LimitExceeded("too many reservations"));
        }

        let reservation = Reservation {
            id: state.next_id(),
            client_id: new.client_id,
            slot: new.slot,
            services: new.services,
            total: new.total,
            phone: new.phone,
            contact_email: new.contact_email,
            status: ReservationStatus::Active,
            created_at,
            cancelled_at: None,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut *state, &event).await?;
        Ok(reservation)
    }

    /// Mark `id` cancelled and free its slot. Only the owning client may do
    /// this; a reservation that is already cancelled counts as not found.
    pub async fn cancel(
        &self,
        id: ReservationId,
        requester: &ClientId,
        cancelled_at: NaiveDateTime,
    ) -> Result<Reservation, ScheduleError> {
        self.cancel_with(id, requester, cancelled_at, |_| Ok(()))
            .await
    }

    /// Like [`cancel`](Self::cancel), with an extra `gate` run on the stored
    /// reservation after the existence and ownership checks.
    pub async fn cancel_with<F>(
        &self,
        id: ReservationId,
        requester: &ClientId,
        cancelled_at: NaiveDateTime,
        gate: F,
    ) -> Result<Reservation, ScheduleError>
    where
        F: FnOnce(&Reservation) -> Result<(), ScheduleError>,
    {
        let mut state = self.state.write().await;
        let current = match state.get(id) {
            Some(r) if r.is_active() => r,
            _ => return Err(ScheduleError::NotFound(id)),
        };
        if current.client_id != *requester {
            return Err(ScheduleError::NotOwner(id));
        }
        gate(current)?;

        let event = Event::ReservationCancelled {
            id,
            client_id: requester.clone(),
            cancelled_at,
        };
        self.persist_and_apply(&mut *state, &event).await?;
        state
            .get(id)
            .cloned()
            .ok_or(ScheduleError::NotFound(id))
    }
}
