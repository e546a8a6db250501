//! Snapshot + history replay.
//!
//! ```text
//! latest snapshot (revision R, content C) ──► Replica::from_text(C)
//!                                                   │
//! operations with timestamp > R (ascending) ──► Replica::apply, one by one
//! ```
//!
//! Replay uses the same `apply` as live editing, so clamping and truncation
//! behave identically. No snapshot means an empty start and a replay of the
//! whole history.

use crate::operation::DocumentId;
use crate::replica::Replica;
use crate::storage::{DocumentStore, StoreError};

/// Outcome of rebuilding one document.
#[derive(Debug)]
pub struct Recovered {
    pub replica: Replica,
    /// Revision of the snapshot used, if any
    pub snapshot_revision: Option<u64>,
    /// Number of history operations applied on top of the snapshot
    pub replayed: usize,
    /// Highest revision or timestamp seen; new operations must be stamped
    /// above it
    pub last_timestamp: u64,
}

/// Rebuild a document's replica from durable history.
///
/// Any store error other than a missing snapshot is returned unchanged.
pub fn recover(store: &dyn DocumentStore, document_id: &DocumentId) -> Result<Recovered, StoreError> {
    let snapshot = match store.latest_snapshot(document_id) {
        Ok(snapshot) => Some(snapshot),
        Err(StoreError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let (replica, since) = match &snapshot {
        Some(s) => (Replica::from_text(document_id.clone(), &s.content), s.revision),
        None => (Replica::new(), 0),
    };

    let operations = store.operations_since(document_id, since)?;
    let mut last_timestamp = since;
    for op in &operations {
        replica.apply(op);
        last_timestamp = last_timestamp.max(op.timestamp);
    }

    log::debug!(
        "Recovered {document_id}: snapshot {:?}, {} operations replayed, {} chars",
        snapshot.as_ref().map(|s| s.revision),
        operations.len(),
        replica.len()
    );

    Ok(Recovered {
        replica,
        snapshot_revision: snapshot.map(|s| s.revision),
        replayed: operations.len(),
        last_timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::storage::{MemoryStore, SnapshotRecord};

    fn stamped(mut op: Operation, timestamp: u64) -> Operation {
        op.timestamp = timestamp;
        op
    }

    #[test]
    fn test_snapshot_plus_replay() {
        let store = MemoryStore::new();
        let doc = DocumentId::new("r");
        store.insert_snapshot(&doc, 100, "abc").unwrap();
        store
            .insert_operation(&stamped(Operation::insert(doc.clone(), 3, "def", "u"), 150))
            .unwrap();

        let rec = recover(&store, &doc).unwrap();
        assert_eq!(rec.replica.read(), "abcdef");
        assert_eq!(rec.snapshot_revision, Some(100));
        assert_eq!(rec.replayed, 1);
        assert_eq!(rec.last_timestamp, 150);
    }

    #[test]
    fn test_operations_before_snapshot_skipped() {
        let store = MemoryStore::new();
        let doc = DocumentId::new("r");
        store
            .insert_operation(&stamped(Operation::insert(doc.clone(), 0, "abc", "u"), 50))
            .unwrap();
        store.insert_snapshot(&doc, 100, "abc").unwrap();
        store
            .insert_operation(&stamped(Operation::delete(doc.clone(), 0, 1, "u"), 120))
            .unwrap();

        let rec = recover(&store, &doc).unwrap();
        assert_eq!(rec.replica.read(), "bc");
        assert_eq!(rec.replayed, 1);
    }

    #[test]
    fn test_no_snapshot_replays_everything() {
        let store = MemoryStore::new();
        let doc = DocumentId::new("r");
        store
            .insert_operation(&stamped(Operation::insert(doc.clone(), 0, "hello", "u"), 1))
            .unwrap();
        store
            .insert_operation(&stamped(Operation::insert(doc.clone(), 5, "!", "u"), 2))
            .unwrap();

        let rec = recover(&store, &doc).unwrap();
        assert_eq!(rec.replica.read(), "hello!");
        assert_eq!(rec.snapshot_revision, None);
        assert_eq!(rec.last_timestamp, 2);
    }

    #[test]
    fn test_unknown_document_starts_empty() {
        let store = MemoryStore::new();
        let rec = recover(&store, &DocumentId::new("nothing")).unwrap();
        assert!(rec.replica.is_empty());
        assert_eq!(rec.replayed, 0);
    }

    #[test]
    fn test_replay_applies_clamping() {
        let store = MemoryStore::new();
        let doc = DocumentId::new("r");
        store.insert_snapshot(&doc, 10, "hi").unwrap();
        store
            .insert_operation(&stamped(Operation::delete(doc.clone(), 5, 1, "u"), 11))
            .unwrap();
        store
            .insert_operation(&stamped(Operation::insert(doc.clone(), 99, "!", "u"), 12))
            .unwrap();

        assert_eq!(recover(&store, &doc).unwrap().replica.read(), "hi!");
    }

    #[test]
    fn test_replay_is_deterministic() {
        let store = MemoryStore::new();
        let doc = DocumentId::new("r");
        store.insert_snapshot(&doc, 1000, "The quick fox").unwrap();
        let edits = [
            Operation::insert(doc.clone(), 4, "brown ", "a"),
            Operation::delete(doc.clone(), 0, 4, "b"),
            Operation::insert(doc.clone(), 100, " jumps", "a"),
            Operation::cursor(doc.clone(), 3, "#fff000", "b"),
            Operation::delete(doc.clone(), 6, 50, "a"),
        ];
        for (i, op) in edits.into_iter().enumerate() {
            store.insert_operation(&stamped(op, 1001 + i as u64)).unwrap();
        }

        let first = recover(&store, &doc).unwrap().replica.read();
        let second = recover(&store, &doc).unwrap().replica.read();
        assert_eq!(first, second);
        assert_eq!(first, "brown ");
    }

    struct BrokenStore;

    impl DocumentStore for BrokenStore {
        fn insert_operation(&self, _: &Operation) -> Result<(), StoreError> {
            Ok(())
        }
        fn insert_snapshot(&self, _: &DocumentId, _: u64, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn latest_snapshot(&self, _: &DocumentId) -> Result<SnapshotRecord, StoreError> {
            Err(StoreError::DatabaseError("unreachable".into()))
        }
        fn operations_since(&self, _: &DocumentId, _: u64) -> Result<Vec<Operation>, StoreError> {
            Ok(Vec::new())
        }
        fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_store_failure_propagates() {
        let result = recover(&BrokenStore, &DocumentId::new("r"));
        assert!(matches!(result, Err(StoreError::DatabaseError(_))));
    }
}
