use chrono::Utc;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;

use super::{validate, Engine, EngineError};

impl Engine {
    /// Persist a new event and its slots as one change.
    pub async fn create_event(
        &self,
        new_event: NewEvent,
        new_slots: Vec<NewTimeSlot>,
    ) -> Result<EventWithSlots, EngineError> {
        validate::new_event(&new_event)?;
        validate::new_slots(&new_slots)?;

        let now = Utc::now();
        let event = Event {
            id: Ulid::new(),
            title: new_event.title,
            description: new_event.description,
            creator_name: new_event.creator_name,
            creator_email: new_event.creator_email,
            created_at: now,
            updated_at: now,
        };
        let mut slots: Vec<TimeSlot> = new_slots
            .into_iter()
            .map(|s| TimeSlot {
                id: Ulid::new(),
                event_id: event.id,
                start_time: s.start_time,
                end_time: s.end_time,
                max_bookings: s.max_bookings,
                status: SLOT_STATUS_AVAILABLE.to_string(),
                created_at: now,
                current_bookings: 0,
            })
            .collect();
        slots.sort_by_key(|s| (s.start_time, s.id));

        let _permit = self.mutation_permit().await;
        let change = Change::EventCreated {
            event: event.clone(),
            slots: slots.clone(),
        };
        self.wal_append(&change)
            .await
            .inspect_err(|e| error!(op = "create_event", event_id = %event.id, "{e}"))?;
        self.store.insert_event(event.clone(), slots.clone());

        info!(event_id = %event.id, slots = slots.len(), "event created");
        Ok(EventWithSlots {
            event,
            time_slots: slots,
        })
    }

    /// Merge the provided fields into the stored event and refresh `updated_at`.
    pub async fn update_event(&self, id: Ulid, patch: EventPatch) -> Result<Event, EngineError> {
        validate::patch(&patch)?;

        let _permit = self.mutation_permit().await;
        let es = self.store.get_event(&id).ok_or(EngineError::EventNotFound(id))?;
        let mut guard = es.write().await;
        if guard.deleted {
            return Err(EngineError::EventNotFound(id));
        }

        let mut merged = guard.event.clone();
        patch.apply(&mut merged);
        merged.updated_at = Utc::now();

        let change = Change::EventUpdated { event: merged };
        self.persist_event_change(&mut guard, &change)
            .await
            .inspect_err(|e| error!(op = "update_event", event_id = %id, "{e}"))?;
        Ok(guard.event.clone())
    }

    /// Delete an event, its slots and their bookings.
    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        let es = self.store.get_event(&id).ok_or(EngineError::EventNotFound(id))?;
        let mut guard = es.write_owned().await;
        if guard.deleted {
            return Err(EngineError::EventNotFound(id));
        }

        // Slot locks in sorted order; concurrent admissions waiting on them
        // observe `deleted` once we release.
        let mut slot_ids = guard.slot_ids.clone();
        slot_ids.sort();
        let mut slot_guards = Vec::with_capacity(slot_ids.len());
        for sid in &slot_ids {
            if let Some(ss) = self.store.get_slot(sid) {
                slot_guards.push(ss.write_owned().await);
            }
        }
        let bookings: usize = slot_guards.iter().map(|g| g.bookings.len()).sum();

        self.wal_append(&Change::EventDeleted { id })
            .await
            .inspect_err(|e| error!(op = "delete_event", event_id = %id, "{e}"))?;
        self.store.detach_event(&mut guard, &mut slot_guards);

        info!(event_id = %id, slots = slot_guards.len(), bookings, "event deleted");
        Ok(())
    }

    /// Overwrite a slot's cached counter. The next read reconciles it against
    /// the booking rows again.
    pub async fn override_slot_counter(
        &self,
        slot_id: Ulid,
        current_bookings: u32,
    ) -> Result<TimeSlot, EngineError> {
        let _permit = self.mutation_permit().await;
        let ss = self
            .store
            .get_slot(&slot_id)
            .ok_or(EngineError::SlotNotFound(slot_id))?;
        let mut guard = ss.write().await;
        if guard.deleted {
            return Err(EngineError::SlotNotFound(slot_id));
        }

        let change = Change::SlotCounterSet {
            id: slot_id,
            current_bookings,
        };
        self.persist_slot_change(&mut guard, &change)
            .await
            .inspect_err(|e| error!(op = "override_slot_counter", %slot_id, "{e}"))?;
        if current_bookings != guard.occupied() {
            warn!(
                %slot_id,
                current_bookings,
                actual = guard.occupied(),
                "slot counter overridden to a value that disagrees with its bookings"
            );
        }
        Ok(guard.slot.clone())
    }
}
