//! Optimistic writes to the rating and collected fields.
//!
//! A toggle lands in the view immediately, then goes to the backend. If the
//! backend refuses, the field is put back to exactly what it was, unless a
//! newer toggle of the same field has been applied since; the newest local
//! value always wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::ledger::{
    EntityId, EntityKind, FieldValue, LedgerChange, LedgerField, LedgerRecord, LedgerService,
};
use crate::session::SessionManager;
use crate::view::EntityList;

type FieldKey = (EntityKind, EntityId, LedgerField);

/// An applied toggle whose write has not settled yet.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    generation: u64,
    /// Whether the entity had a ledger row before the oldest unsettled toggle.
    existed: bool,
    /// Value to show again if this toggle fails while it is the newest.
    prior: FieldValue,
}

pub struct OptimisticToggleEngine<L> {
    ledger: Arc<L>,
    session: SessionManager,
    next_generation: AtomicU64,
    /// Unsettled toggles per field, oldest first. Emptied keys are removed.
    in_flight: Mutex<HashMap<FieldKey, Vec<InFlight>>>,
}

impl<L: LedgerService> OptimisticToggleEngine<L> {
    pub fn new(ledger: Arc<L>, session: SessionManager) -> Self {
        Self {
            ledger,
            session,
            next_generation: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Applies `change` to the entry in `list`, then commits it.
    ///
    /// # Errors
    ///
    /// [`SyncError::Unauthorized`] without a session; nothing is touched and
    /// no request is made. Any backend failure is returned after the local
    /// value has been rolled back.
    pub async fn toggle(
        &self,
        list: &EntityList,
        kind: EntityKind,
        id: EntityId,
        change: LedgerChange,
    ) -> Result<(), SyncError> {
        self.session
            .require_authenticated()
            .await
            .map_err(SyncError::normalized)?;

        let key = (kind, id, change.field());
        let generation = self.apply(list, key, change);

        match self.ledger.write_record(kind, id, change).await {
            Ok(_) => {
                self.settle_committed(key, generation);
                debug!(%kind, id, ?change, "toggle: committed");
                Ok(())
            }
            Err(err) => {
                let err = err.normalized();
                if self.settle_failed(list, key, generation) {
                    warn!(%kind, id, ?change, error = %err, "toggle: failed, rolled back");
                } else {
                    debug!(%kind, id, ?change, error = %err, "toggle: failed, newer value kept");
                }
                Err(err)
            }
        }
    }

    /// Clears the collected flag and lets the caller drop the entry from its
    /// list before the backend answers. The removal is never undone, even if
    /// the write fails.
    pub async fn remove_from_collection(
        &self,
        list: &EntityList,
        kind: EntityKind,
        id: EntityId,
        remove_local: impl FnOnce(),
    ) -> Result<(), SyncError> {
        self.session
            .require_authenticated()
            .await
            .map_err(SyncError::normalized)?;
        remove_local();
        self.toggle(list, kind, id, LedgerChange::Collected(false)).await
    }

    fn apply(&self, list: &EntityList, key: FieldKey, change: LedgerChange) -> u64 {
        let (kind, id, _) = key;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // Lock order is in_flight, then the list.
        let mut in_flight = self.in_flight.lock();
        let applied = list.update(kind, id, |entity| {
            let existed = entity.ledger.is_some();
            let record = entity
                .ledger
                .get_or_insert_with(|| LedgerRecord::empty(kind, id));
            (existed, record.apply(change))
        });
        if let Some((existed, prior)) = applied {
            in_flight.entry(key).or_default().push(InFlight {
                generation,
                existed,
                prior,
            });
        }
        generation
    }

    /// The backend accepted this value, so older unsettled toggles may no
    /// longer roll back past it.
    fn settle_committed(&self, key: FieldKey, generation: u64) {
        let mut in_flight = self.in_flight.lock();
        let Some(stack) = in_flight.get_mut(&key) else {
            return;
        };
        if let Some(pos) = stack.iter().position(|t| t.generation == generation) {
            stack.drain(..=pos);
        }
        if stack.is_empty() {
            in_flight.remove(&key);
        }
    }

    /// Returns whether the view was rolled back.
    fn settle_failed(&self, list: &EntityList, key: FieldKey, generation: u64) -> bool {
        let (kind, id, _) = key;
        let mut in_flight = self.in_flight.lock();
        let Some(stack) = in_flight.get_mut(&key) else {
            return false;
        };
        let Some(pos) = stack.iter().position(|t| t.generation == generation) else {
            return false;
        };

        let failed = stack.remove(pos);
        let rolled_back = if pos == stack.len() {
            list.update(kind, id, |entity| {
                if let Some(record) = entity.ledger.as_mut() {
                    record.set(failed.prior);
                    if !failed.existed && record.is_blank() {
                        entity.ledger = None;
                    }
                }
            });
            true
        } else {
            // The next toggle now undoes to what this one replaced.
            let newer = &mut stack[pos];
            newer.prior = failed.prior;
            newer.existed = failed.existed;
            false
        };
        if stack.is_empty() {
            in_flight.remove(&key);
        }
        rolled_back
    }
}
