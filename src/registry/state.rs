use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;

use crate::model::*;

/// In-memory reservation set plus the indexes every query needs.
///
/// Mutated only through [`RegistryState::apply`], so WAL replay and live
/// writes go through the same code.
#[derive(Debug, Default, Clone)]
pub struct RegistryState {
    reservations: BTreeMap<ReservationId, Reservation>,
    /// Active reservations only. One entry per slot is the uniqueness invariant.
    active: BTreeMap<Slot, ReservationId>,
    /// Every reservation of a client, active or cancelled.
    by_client: HashMap<ClientId, BTreeSet<(Slot, ReservationId)>>,
    next_id: u64,
}

impl RegistryState {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn next_id(&self) -> ReservationId {
        ReservationId(self.next_id.max(1))
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn get(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    pub fn is_occupied(&self, slot: &Slot) -> bool {
        self.active.contains_key(slot)
    }

    /// Client history, newest slot first.
    pub fn by_client(&self, client: &ClientId) -> impl Iterator<Item = &Reservation> {
        self.by_client
            .get(client)
            .into_iter()
            .flat_map(|set| set.iter().rev())
            .filter_map(|(_, id)| self.reservations.get(id))
    }

    pub fn most_recent_active(&self, client: &ClientId) -> Option<&Reservation> {
        self.by_client(client).find(|r| r.is_active())
    }

    /// Latest active reservation of `client` dated on or before `date`.
    pub fn most_recent_active_on_or_before(
        &self,
        client: &ClientId,
        date: NaiveDate,
    ) -> Option<&Reservation> {
        self.by_client(client)
            .filter(|r| r.date() <= date)
            .find(|r| r.is_active())
    }

    /// Active slots in `(date, time)` order.
    pub fn active_slots(&self) -> impl Iterator<Item = &Slot> {
        self.active.keys()
    }

    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = SlotTime> + '_ {
        let from = Slot::new(date, SlotTime::MIDNIGHT);
        self.active
            .range(from..)
            .take_while(move |(slot, _)| slot.date == date)
            .map(|(slot, _)| slot.time)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                let r = reservation.clone();
                if r.is_active() {
                    self.active.insert(r.slot, r.id);
                }
                self.by_client
                    .entry(r.client_id.clone())
                    .or_default()
                    .insert((r.slot, r.id));
                self.next_id = self.next_id.max(r.id.0 + 1);
                self.reservations.insert(r.id, r);
            }
            Event::ReservationCancelled {
                id, cancelled_at, ..
            } => {
                if let Some(r) = self.reservations.get_mut(id)
                    && r.is_active()
                {
                    r.status = ReservationStatus::Cancelled;
                    r.cancelled_at = Some(*cancelled_at);
                    if self.active.get(&r.slot) == Some(id) {
                        self.active.remove(&r.slot);
                    }
                }
            }
        }
    }

    /// Minimal event list that rebuilds this state.
    pub fn snapshot_events(&self) -> Vec<Event> {
        self.reservations
            .values()
            .map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            })
            .collect()
    }
}
