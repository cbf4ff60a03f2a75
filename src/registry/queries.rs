use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::model::*;

use super::{RegistryState, SlotRegistry};

impl SlotRegistry {
    pub async fn is_occupied(&self, slot: &Slot) -> bool {
        self.state.read().await.is_occupied(slot)
    }

    pub async fn get(&self, id: ReservationId) -> Option<Reservation> {
        self.state.read().await.get(id).cloned()
    }

    /// Every reservation of `client`, cancelled ones included, newest first.
    pub async fn list_by_client(&self, client: &ClientId) -> Vec<Reservation> {
        self.state.read().await.by_client(client).cloned().collect()
    }

    pub async fn most_recent_by_client(&self, client: &ClientId) -> Option<Reservation> {
        self.state.read().await.most_recent_active(client).cloned()
    }

    pub async fn most_recent_on_or_before(
        &self,
        client: &ClientId,
        date: NaiveDate,
    ) -> Option<Reservation> {
        self.state
            .read()
            .await
            .most_recent_active_on_or_before(client, date)
            .cloned()
    }

    /// Active slots grouped by date. Dates with nothing booked are absent.
    pub async fn all_occupied(&self) -> BTreeMap<NaiveDate, BTreeSet<SlotTime>> {
        let state = self.state.read().await;
        let mut out: BTreeMap<NaiveDate, BTreeSet<SlotTime>> = BTreeMap::new();
        for slot in state.active_slots() {
            out.entry(slot.date).or_default().insert(slot.time);
        }
        out
    }

    /// Occupied times on `date`, ascending.
    pub async fn occupied_on(&self, date: NaiveDate) -> Vec<SlotTime> {
        self.state.read().await.active_on(date).collect()
    }

    pub async fn active_count(&self) -> usize {
        self.state.read().await.active_count()
    }

    /// Run `f` against a consistent read snapshot.
    pub async fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> T {
        f(&*self.state.read().await)
    }
}
