use chrono::Utc;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, CANCELLATIONS_TOTAL};

use super::store::SlotState;
use super::{validate, Engine, EngineError};

/// Capacity then uniqueness, both against the authoritative booking rows.
pub fn check_admission(ss: &SlotState, attendee_email: &str) -> Result<(), Rejection> {
    if ss.occupied() >= ss.slot.max_bookings {
        return Err(Rejection::SlotFull {
            max_bookings: ss.slot.max_bookings,
        });
    }
    if ss.booking_for_email(attendee_email).is_some() {
        return Err(Rejection::DuplicateBooking);
    }
    Ok(())
}

fn outcome_label(admission: &Admission) -> &'static str {
    match admission {
        Ok(_) => "booked",
        Err(Rejection::SlotFull { .. }) => "slot_full",
        Err(Rejection::DuplicateBooking) => "duplicate",
    }
}

impl Engine {
    /// Admit or reject a booking.
    ///
    /// The check and the insert run under the slot's write lock, and the WAL
    /// append completes before the lock is released, so admission on a slot
    /// is serializable: concurrent requests can never both pass the capacity
    /// check. Business rejections come back as `Ok(Err(Rejection))`; only
    /// faults are `Err`.
    pub async fn attempt_booking(&self, req: BookingRequest) -> Result<Admission, EngineError> {
        validate::booking_request(&req)?;
        let admission = self.admit(&req).await?;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome_label(&admission)).increment(1);
        Ok(admission)
    }

    async fn admit(&self, req: &BookingRequest) -> Result<Admission, EngineError> {
        let permit = self.mutation_permit().await;
        let ss = self
            .store
            .get_slot(&req.time_slot_id)
            .ok_or(EngineError::SlotNotFound(req.time_slot_id))?;
        let mut guard = ss.write().await;
        if guard.deleted {
            return Err(EngineError::SlotNotFound(req.time_slot_id));
        }
        if guard.slot.event_id != req.event_id {
            return Err(EngineError::SlotNotInEvent {
                slot_id: req.time_slot_id,
                event_id: req.event_id,
            });
        }

        if let Err(rejection) = check_admission(&guard, &req.attendee_email) {
            debug!(
                slot_id = %req.time_slot_id,
                occupied = guard.occupied(),
                max_bookings = guard.slot.max_bookings,
                "booking rejected: {}",
                rejection.message()
            );
            return Ok(Err(rejection));
        }

        let booking = Booking {
            id: Ulid::new(),
            event_id: req.event_id,
            time_slot_id: req.time_slot_id,
            attendee_name: req.attendee_name.clone(),
            attendee_email: req.attendee_email.clone(),
            created_at: Utc::now(),
        };
        let change = Change::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_slot_change(&mut guard, &change)
            .await
            .inspect_err(|e| {
                error!(
                    op = "attempt_booking",
                    event_id = %req.event_id,
                    slot_id = %req.time_slot_id,
                    "{e}"
                )
            })?;
        let (slot_start_time, slot_end_time) = (guard.slot.start_time, guard.slot.end_time);
        drop(guard);
        drop(permit);

        // Event lock is taken only after the slot lock is released.
        let event_title = self.event_title(&req.event_id).await;
        info!(booking_id = %booking.id, slot_id = %req.time_slot_id, "booking created");
        Ok(Ok(BookingDetails {
            booking,
            event_title,
            slot_start_time,
            slot_end_time,
        }))
    }

    /// Best-effort title lookup; never fails the caller.
    pub(super) async fn event_title(&self, event_id: &Ulid) -> String {
        match self.store.get_event(event_id) {
            Some(es) => {
                let guard = es.read().await;
                if guard.deleted {
                    UNKNOWN_EVENT_TITLE.to_string()
                } else {
                    guard.event.title.clone()
                }
            }
            None => UNKNOWN_EVENT_TITLE.to_string(),
        }
    }

    /// Cancel a booking owned by `attendee_email`.
    ///
    /// Returns `false` without mutating anything when the booking doesn't
    /// exist or the email doesn't match exactly.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        attendee_email: &str,
    ) -> Result<bool, EngineError> {
        let _permit = self.mutation_permit().await;
        let Some(slot_id) = self.store.slot_for_booking(&booking_id) else {
            return Ok(false);
        };
        let Some(ss) = self.store.get_slot(&slot_id) else {
            return Ok(false);
        };
        let mut guard = ss.write().await;
        if guard.deleted {
            return Ok(false);
        }
        match guard.booking(&booking_id) {
            Some(b) if b.attendee_email == attendee_email => {}
            _ => {
                debug!(%booking_id, "cancellation refused: unknown booking or email mismatch");
                return Ok(false);
            }
        }

        let change = Change::BookingCancelled {
            id: booking_id,
            time_slot_id: slot_id,
        };
        self.persist_slot_change(&mut guard, &change)
            .await
            .inspect_err(|e| error!(op = "cancel_booking", %booking_id, %slot_id, "{e}"))?;
        metrics::counter!(CANCELLATIONS_TOTAL).increment(1);
        info!(%booking_id, %slot_id, current_bookings = guard.slot.current_bookings, "booking cancelled");
        Ok(true)
    }
}
