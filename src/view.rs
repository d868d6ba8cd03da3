//! The in-memory list a view renders.
//!
//! Writers address entries by `(kind, id)`, never by position, so a removal
//! that lands between a fetch and its write-back cannot shift a result onto
//! the wrong entity. Once the list is closed every write is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::join::JoinedEntity;
use crate::ledger::{EntityId, EntityKind};

#[derive(Clone, Default)]
pub struct EntityList {
    entries: Arc<Mutex<Vec<JoinedEntity>>>,
    cancel: CancellationToken,
}

impl EntityList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: Vec<JoinedEntity>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entities)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> Vec<JoinedEntity> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<JoinedEntity> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.kind == kind && entry.id == id)
            .cloned()
    }

    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.get(kind, id).is_some()
    }

    /// Runs `f` on the entry with this identity. `None` when the list is
    /// closed or the entry is gone.
    pub fn update<R>(
        &self,
        kind: EntityKind,
        id: EntityId,
        f: impl FnOnce(&mut JoinedEntity) -> R,
    ) -> Option<R> {
        if self.cancel.is_cancelled() {
            debug!(%kind, id, "view: closed, dropping update");
            return None;
        }
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .find(|entry| entry.kind == kind && entry.id == id)
            .map(f)
    }

    /// Appends in order. Returns `false` if the list is closed.
    pub fn extend(&self, entities: impl IntoIterator<Item = JoinedEntity>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.entries.lock().extend(entities);
        true
    }

    pub fn remove(&self, kind: EntityKind, id: EntityId) -> Option<JoinedEntity> {
        let mut entries = self.entries.lock();
        let idx = entries
            .iter()
            .position(|entry| entry.kind == kind && entry.id == id)?;
        Some(entries.remove(idx))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Tears the view down; pending completions are dropped from now on.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
