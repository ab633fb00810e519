use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (Timestamp, Ulid)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

impl Engine {
    /// Event with its slots, every slot reconciled on the way out.
    pub async fn get_event_by_id(&self, id: Ulid) -> Result<EventWithSlots, EngineError> {
        self.compose_event(id)
            .await?
            .ok_or(EngineError::EventNotFound(id))
    }

    async fn compose_event(&self, id: Ulid) -> Result<Option<EventWithSlots>, EngineError> {
        let Some(es) = self.store.get_event(&id) else {
            return Ok(None);
        };
        // Copy out and release the event lock before touching slots, so a
        // repair never waits on the compaction gate while holding it.
        let (event, slot_ids) = {
            let guard = es.read().await;
            if guard.deleted {
                return Ok(None);
            }
            (guard.event.clone(), guard.slot_ids.clone())
        };

        let mut time_slots = Vec::with_capacity(slot_ids.len());
        for sid in &slot_ids {
            let Some(ss) = self.store.get_slot(sid) else { continue };
            if let Some(slot) = self.reconcile_slot(&ss).await? {
                time_slots.push(slot);
            }
        }
        time_slots.sort_by_key(|s| (s.start_time, s.id));
        Ok(Some(EventWithSlots { event, time_slots }))
    }

    /// All events without slots, newest first.
    pub async fn list_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for es in self.store.event_states() {
            let guard = es.read().await;
            if !guard.deleted {
                events.push(guard.event.clone());
            }
        }
        newest_first(&mut events, |e| (e.created_at, e.id));
        events
    }

    /// All events with their reconciled slots, newest first.
    pub async fn list_events_with_slots(&self) -> Result<Vec<EventWithSlots>, EngineError> {
        let mut ids = Vec::new();
        for es in self.store.event_states() {
            let guard = es.read().await;
            if !guard.deleted {
                ids.push(guard.event.id);
            }
        }

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            // Deleted since the snapshot: skip rather than fail the listing.
            if let Some(composed) = self.compose_event(id).await? {
                result.push(composed);
            }
        }
        newest_first(&mut result, |e| (e.event.created_at, e.event.id));
        Ok(result)
    }

    pub async fn get_time_slot(&self, id: Ulid) -> Result<TimeSlot, EngineError> {
        let ss = self.store.get_slot(&id).ok_or(EngineError::SlotNotFound(id))?;
        self.reconcile_slot(&ss)
            .await?
            .ok_or(EngineError::SlotNotFound(id))
    }

    pub async fn list_time_slots(&self, event_id: Ulid) -> Result<Vec<TimeSlot>, EngineError> {
        Ok(self.get_event_by_id(event_id).await?.time_slots)
    }

    /// Every booking made with `email`, enriched, newest first.
    pub async fn bookings_by_email(&self, email: &str) -> Vec<BookingDetails> {
        let mut found = Vec::new();
        for ss in self.store.slot_states() {
            let guard = ss.read().await;
            if guard.deleted {
                continue;
            }
            if let Some(b) = guard.booking_for_email(email) {
                found.push((b.clone(), guard.slot.start_time, guard.slot.end_time));
            }
        }
        self.enrich(found).await
    }

    /// Every booking on an event's slots, enriched, newest first. Unknown
    /// events have no bookings.
    pub async fn bookings_by_event(&self, event_id: Ulid) -> Vec<BookingDetails> {
        let Some(es) = self.store.get_event(&event_id) else {
            return Vec::new();
        };
        let slot_ids = {
            let guard = es.read().await;
            if guard.deleted {
                return Vec::new();
            }
            guard.slot_ids.clone()
        };

        let mut found = Vec::new();
        for sid in &slot_ids {
            let Some(ss) = self.store.get_slot(sid) else { continue };
            let guard = ss.read().await;
            if guard.deleted {
                continue;
            }
            for b in &guard.bookings {
                found.push((b.clone(), guard.slot.start_time, guard.slot.end_time));
            }
        }
        self.enrich(found).await
    }

    async fn enrich(&self, found: Vec<(Booking, Timestamp, Timestamp)>) -> Vec<BookingDetails> {
        let mut titles: HashMap<Ulid, String> = HashMap::new();
        let mut details = Vec::with_capacity(found.len());
        for (booking, slot_start_time, slot_end_time) in found {
            let event_title = match titles.get(&booking.event_id) {
                Some(title) => title.clone(),
                None => {
                    let title = self.event_title(&booking.event_id).await;
                    titles.insert(booking.event_id, title.clone());
                    title
                }
            };
            details.push(BookingDetails {
                booking,
                event_title,
                slot_start_time,
                slot_end_time,
            });
        }
        newest_first(&mut details, |d| (d.booking.created_at, d.booking.id));
        details
    }
}
