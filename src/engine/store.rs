use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedEventState = Arc<RwLock<EventState>>;
pub type SharedSlotState = Arc<RwLock<SlotState>>;

#[derive(Debug, Clone)]
pub struct EventState {
    pub event: Event,
    pub slot_ids: Vec<Ulid>,
    /// Set under the write lock when the event is deleted, so holders of a
    /// stale `Arc` observe the deletion.
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: TimeSlot,
    /// Authoritative booking rows, in insertion order.
    pub bookings: Vec<Booking>,
    pub deleted: bool,
}

impl SlotState {
    pub fn new(slot: TimeSlot) -> Self {
        Self {
            slot,
            bookings: Vec::new(),
            deleted: false,
        }
    }

    /// True occupancy, derived from the booking rows.
    pub fn occupied(&self) -> u32 {
        self.bookings.len() as u32
    }

    pub fn booking_for_email(&self, email: &str) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.attendee_email == email)
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    fn remove_booking(&mut self, id: &Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == *id)?;
        Some(self.bookings.remove(pos))
    }
}

/// Apply a slot-scoped change. No locking; the caller holds the slot lock.
pub(crate) fn apply_to_slot(ss: &mut SlotState, change: &Change, booking_index: &DashMap<Ulid, Ulid>) {
    match change {
        Change::BookingCreated { booking } => {
            booking_index.insert(booking.id, booking.time_slot_id);
            ss.bookings.push(booking.clone());
            ss.slot.current_bookings = ss.slot.current_bookings.saturating_add(1);
        }
        Change::BookingCancelled { id, .. } => {
            if ss.remove_booking(id).is_some() {
                booking_index.remove(id);
                ss.slot.current_bookings = ss.slot.current_bookings.saturating_sub(1);
            }
        }
        Change::SlotCounterSet {
            current_bookings, ..
        } => {
            ss.slot.current_bookings = *current_bookings;
        }
        // Event-scoped changes are handled by `apply_to_event` and the store maps
        Change::EventCreated { .. } | Change::EventUpdated { .. } | Change::EventDeleted { .. } => {}
    }
}

/// Apply an event-scoped change (caller holds the event lock).
pub(crate) fn apply_to_event(es: &mut EventState, change: &Change) {
    if let Change::EventUpdated { event } = change {
        es.event = event.clone();
    }
}

/// The entity store: events, slots and bookings held in lock-per-entity state.
pub struct Store {
    events: DashMap<Ulid, SharedEventState>,
    slots: DashMap<Ulid, SharedSlotState>,
    /// Reverse lookup: booking id → slot id
    pub(crate) booking_to_slot: DashMap<Ulid, Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            slots: DashMap::new(),
            booking_to_slot: DashMap::new(),
        }
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn get_event(&self, id: &Ulid) -> Option<SharedEventState> {
        self.events.get(id).map(|e| e.value().clone())
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_slot.get(booking_id).map(|e| *e.value())
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Snapshot of all event states. Never hold a shard ref across an await.
    pub fn event_states(&self) -> Vec<SharedEventState> {
        self.events.iter().map(|e| e.value().clone()).collect()
    }

    pub fn slot_states(&self) -> Vec<SharedSlotState> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    // ── Map-level mutations ──────────────────────────────────

    pub fn insert_event(&self, event: Event, slots: Vec<TimeSlot>) {
        let slot_ids = slots.iter().map(|s| s.id).collect();
        for slot in slots {
            self.slots
                .insert(slot.id, Arc::new(RwLock::new(SlotState::new(slot))));
        }
        let id = event.id;
        self.events.insert(
            id,
            Arc::new(RwLock::new(EventState {
                event,
                slot_ids,
                deleted: false,
            })),
        );
    }

    /// Remove an event and cascade to its slots and their bookings.
    /// Caller holds the event lock and every slot lock.
    pub fn detach_event(
        &self,
        es: &mut EventState,
        slot_guards: &mut [OwnedRwLockWriteGuard<SlotState>],
    ) {
        for ss in slot_guards.iter_mut() {
            for booking in &ss.bookings {
                self.booking_to_slot.remove(&booking.id);
            }
            ss.deleted = true;
            self.slots.remove(&ss.slot.id);
        }
        es.deleted = true;
        self.events.remove(&es.event.id);
    }

    // ── Replay ───────────────────────────────────────────────

    /// Apply a change read back from the WAL. Runs before the engine is
    /// shared, so every lock is uncontended.
    pub fn replay(&self, change: &Change) -> io::Result<()> {
        match change {
            Change::EventCreated { event, slots } => {
                self.insert_event(event.clone(), slots.clone());
            }
            Change::EventUpdated { event } => {
                if let Some(es) = self.get_event(&event.id) {
                    let mut guard = es.try_write().map_err(|_| contended("event"))?;
                    apply_to_event(&mut guard, change);
                }
            }
            Change::EventDeleted { id } => {
                if let Some(es) = self.get_event(id) {
                    let mut guard = es.try_write_owned().map_err(|_| contended("event"))?;
                    let mut slot_guards = Vec::with_capacity(guard.slot_ids.len());
                    for sid in &guard.slot_ids {
                        if let Some(ss) = self.get_slot(sid) {
                            slot_guards.push(ss.try_write_owned().map_err(|_| contended("slot"))?);
                        }
                    }
                    self.detach_event(&mut guard, &mut slot_guards);
                }
            }
            Change::BookingCreated { booking } => {
                self.replay_slot_change(&booking.time_slot_id, change)?;
            }
            Change::BookingCancelled { time_slot_id, .. } => {
                self.replay_slot_change(time_slot_id, change)?;
            }
            Change::SlotCounterSet { id, .. } => {
                self.replay_slot_change(id, change)?;
            }
        }
        Ok(())
    }

    fn replay_slot_change(&self, slot_id: &Ulid, change: &Change) -> io::Result<()> {
        if let Some(ss) = self.get_slot(slot_id) {
            let mut guard = ss.try_write().map_err(|_| contended("slot"))?;
            apply_to_slot(&mut guard, change, &self.booking_to_slot);
        }
        Ok(())
    }
}

fn contended(what: &str) -> io::Error {
    io::Error::other(format!("replay: {what} lock unexpectedly contended"))
}
