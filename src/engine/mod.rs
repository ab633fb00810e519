mod admission;
mod error;
mod lifecycle;
mod queries;
mod reconcile;
mod store;
mod validate;

pub use admission::check_admission;
pub use error::{EngineError, ErrorClass};
pub use reconcile::{drift, reconcile};
pub use store::{EventState, SharedEventState, SharedSlotState, SlotState, Store};
pub use validate::is_valid_email;

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};
use tracing::info;

use crate::model::*;
use crate::wal::Wal;

use store::{apply_to_event, apply_to_slot};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { change, response } => {
                let mut batch = vec![(change, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { change, response }) => {
                            batch.push((change, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Change, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(op = "wal_flush", batch = batch.len(), "WAL flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(change, _)| wal.append_buffered(change))
        .and_then(|()| wal.flush_sync());
    // Every caller hears Err, so none of the batch may surface on a later flush.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!(op = "wal_rollback", "discarding failed WAL batch failed: {e}");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { changes, response } => {
            let result = Wal::write_compact_file(wal.path(), &changes)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { change, response } => {
            let mut batch = vec![(change, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

/// Events, time slots and bookings, durable through the WAL.
///
/// Lock order is compaction gate → event → slot(s). Mutations take the gate
/// shared before any entity lock; compaction takes it exclusively so its
/// snapshot can't miss a change that lands in the old log.
pub struct Engine {
    pub store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    compaction_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let changes = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        for change in &changes {
            store.replay(change)?;
        }
        if !changes.is_empty() {
            info!(
                changes = changes.len(),
                events = store.event_count(),
                slots = store.slot_count(),
                "replayed WAL"
            );
        }

        Ok(Self {
            store,
            wal_tx,
            compaction_gate: RwLock::new(()),
        })
    }

    /// Shared side of the compaction gate; hold it across append + apply.
    pub(super) async fn mutation_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.compaction_gate.read().await
    }

    /// Write a change to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, change: &Change) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply to a slot the caller holds locked.
    pub(super) async fn persist_slot_change(
        &self,
        ss: &mut SlotState,
        change: &Change,
    ) -> Result<(), EngineError> {
        self.wal_append(change).await?;
        apply_to_slot(ss, change, &self.store.booking_to_slot);
        Ok(())
    }

    /// WAL-append + apply to an event the caller holds locked.
    pub(super) async fn persist_event_change(
        &self,
        es: &mut EventState,
        change: &Change,
    ) -> Result<(), EngineError> {
        self.wal_append(change).await?;
        apply_to_event(es, change);
        Ok(())
    }

    /// Rewrite the WAL with only the changes needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut changes = Vec::new();
        for es in self.store.event_states() {
            let event_guard = es.read().await;
            if event_guard.deleted {
                continue;
            }
            let mut slots = Vec::with_capacity(event_guard.slot_ids.len());
            let mut slot_changes = Vec::new();
            for sid in &event_guard.slot_ids {
                let Some(ss) = self.store.get_slot(sid) else { continue };
                let slot_guard = ss.read().await;
                // Bookings replay their own increments; the stored counter is
                // restored afterwards so drift survives compaction unchanged.
                slots.push(TimeSlot {
                    current_bookings: 0,
                    ..slot_guard.slot.clone()
                });
                for booking in &slot_guard.bookings {
                    slot_changes.push(Change::BookingCreated {
                        booking: booking.clone(),
                    });
                }
                if slot_guard.slot.current_bookings != slot_guard.occupied() {
                    slot_changes.push(Change::SlotCounterSet {
                        id: slot_guard.slot.id,
                        current_bookings: slot_guard.slot.current_bookings,
                    });
                }
            }
            changes.push(Change::EventCreated {
                event: event_guard.event.clone(),
                slots,
            });
            changes.extend(slot_changes);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                changes,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
