use tracing::{error, warn};

use crate::model::*;
use crate::observability::COUNTER_REPAIRS_TOTAL;

use super::store::SharedSlotState;
use super::{Engine, EngineError};

/// The corrected counter, if the cached one disagrees with the rows.
pub fn drift(slot: &TimeSlot, bookings: &[Booking]) -> Option<u32> {
    let actual = bookings.len() as u32;
    (actual != slot.current_bookings).then_some(actual)
}

/// Recompute `current_bookings` from the booking rows.
pub fn reconcile(slot: &TimeSlot, bookings: &[Booking]) -> TimeSlot {
    match drift(slot, bookings) {
        Some(actual) => TimeSlot {
            current_bookings: actual,
            ..slot.clone()
        },
        None => slot.clone(),
    }
}

impl Engine {
    /// Read-repair one slot. Returns `None` if the slot was deleted.
    ///
    /// Drift is detected under the read lock and re-checked under the write
    /// lock, so of two readers racing on the same drift only the first writes.
    pub(super) async fn reconcile_slot(
        &self,
        ss: &SharedSlotState,
    ) -> Result<Option<TimeSlot>, EngineError> {
        {
            let guard = ss.read().await;
            if guard.deleted {
                return Ok(None);
            }
            if drift(&guard.slot, &guard.bookings).is_none() {
                return Ok(Some(guard.slot.clone()));
            }
        }

        let _permit = self.mutation_permit().await;
        let mut guard = ss.write().await;
        if guard.deleted {
            return Ok(None);
        }
        let Some(actual) = drift(&guard.slot, &guard.bookings) else {
            return Ok(Some(guard.slot.clone()));
        };

        let slot_id = guard.slot.id;
        let stored = guard.slot.current_bookings;
        let change = Change::SlotCounterSet {
            id: slot_id,
            current_bookings: actual,
        };
        self.persist_slot_change(&mut guard, &change)
            .await
            .inspect_err(|e| error!(op = "reconcile_slot", %slot_id, "{e}"))?;
        metrics::counter!(COUNTER_REPAIRS_TOTAL).increment(1);
        warn!(%slot_id, stored, actual, "repaired booking counter drift");
        Ok(Some(guard.slot.clone()))
    }
}
