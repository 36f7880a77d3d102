//! Index changes derived from committed work.
//!
//! The coordinator emits an [`IndexChange`] for every index-relevant
//! operation of a committed transaction. Changes go to a [`ChangeSink`],
//! normally the sync engine's change queue.
//!
//! # Usage
//!
//! ```rust,ignore
//! let sink = Arc::new(ChangeRecorder::new());
//! let coordinator = TransactionCoordinator::new(store, config).with_sink(sink.clone());
//!
//! // ... commit a transaction with an indexed write ...
//!
//! for change in sink.changes() {
//!     println!("{} {}", change.kind, change.key);
//! }
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::{ChangeKind, Document, EntityKey};
use parking_lot::RwLock;

/// A change to mirror into the search index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexChange {
    /// Target document.
    pub key: EntityKey,
    /// Upsert or delete.
    pub kind: ChangeKind,
    /// Document body for upserts. None for deletes.
    pub payload: Option<Document>,
}

impl IndexChange {
    /// Creates an upsert change.
    pub fn upsert(key: EntityKey, payload: Document) -> Self {
        Self {
            key,
            kind: ChangeKind::Upsert,
            payload: Some(payload),
        }
    }

    /// Creates a delete change.
    pub fn delete(key: EntityKey) -> Self {
        Self {
            key,
            kind: ChangeKind::Delete,
            payload: None,
        }
    }
}

/// Receives index changes.
///
/// `push` must not block on I/O: it is called on the commit path.
pub trait ChangeSink: Send + Sync {
    /// Accepts one change.
    fn push(&self, change: IndexChange) -> CoreResult<()>;
}

/// A sink that keeps every change in memory.
///
/// Useful for tests and for observing what a commit emitted.
#[derive(Debug, Default)]
pub struct ChangeRecorder {
    changes: RwLock<Vec<IndexChange>>,
    reject: RwLock<bool>,
}

impl ChangeRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent pushes fail with `QueueClosed`.
    pub fn set_rejecting(&self, reject: bool) {
        *self.reject.write() = reject;
    }

    /// Returns all recorded changes in push order.
    pub fn changes(&self) -> Vec<IndexChange> {
        self.changes.read().clone()
    }

    /// Returns the number of recorded changes.
    pub fn len(&self) -> usize {
        self.changes.read().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.changes.read().is_empty()
    }
}

impl ChangeSink for ChangeRecorder {
    fn push(&self, change: IndexChange) -> CoreResult<()> {
        if *self.reject.read() {
            return Err(CoreError::QueueClosed);
        }
        self.changes.write().push(change);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_constructors() {
        let key = EntityKey::new("listing", "L1");
        let up = IndexChange::upsert(key.clone(), json!({"title": "Bike"}));
        assert_eq!(up.kind, ChangeKind::Upsert);
        assert!(up.payload.is_some());

        let del = IndexChange::delete(key);
        assert_eq!(del.kind, ChangeKind::Delete);
        assert!(del.payload.is_none());
    }

    #[test]
    fn recorder_preserves_order() {
        let recorder = ChangeRecorder::new();
        recorder
            .push(IndexChange::delete(EntityKey::new("listing", "a")))
            .unwrap();
        recorder
            .push(IndexChange::delete(EntityKey::new("listing", "b")))
            .unwrap();

        let ids: Vec<_> = recorder.changes().into_iter().map(|c| c.key.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn rejecting_recorder() {
        let recorder = ChangeRecorder::new();
        recorder.set_rejecting(true);
        let result = recorder.push(IndexChange::delete(EntityKey::new("listing", "a")));
        assert_eq!(result, Err(CoreError::QueueClosed));
        assert!(recorder.is_empty());
    }
}
