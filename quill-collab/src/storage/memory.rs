//! Process-local document history.
//!
//! Used when the server runs without a storage path, and by tests that do
//! not need RocksDB. Nothing survives the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{DocumentStore, SnapshotRecord, StoreError};
use crate::operation::{DocumentId, Operation};

#[derive(Debug, Default)]
struct StoredDocument {
    snapshots: BTreeMap<u64, String>,
    operations: BTreeMap<(u64, Uuid), Operation>,
}

/// In-memory [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, StoredDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations stored for a document.
    pub fn operation_count(&self, document_id: &DocumentId) -> usize {
        self.lock()
            .get(document_id)
            .map_or(0, |doc| doc.operations.len())
    }

    /// Number of snapshots stored for a document.
    pub fn snapshot_count(&self, document_id: &DocumentId) -> usize {
        self.lock()
            .get(document_id)
            .map_or(0, |doc| doc.snapshots.len())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DocumentId, StoredDocument>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for MemoryStore {
    fn insert_operation(&self, op: &Operation) -> Result<(), StoreError> {
        self.lock()
            .entry(op.document_id.clone())
            .or_default()
            .operations
            .insert((op.timestamp, op.operation_id), op.clone());
        Ok(())
    }

    fn insert_snapshot(
        &self,
        document_id: &DocumentId,
        revision: u64,
        content: &str,
    ) -> Result<(), StoreError> {
        self.lock()
            .entry(document_id.clone())
            .or_default()
            .snapshots
            .insert(revision, content.to_string());
        Ok(())
    }

    fn latest_snapshot(&self, document_id: &DocumentId) -> Result<SnapshotRecord, StoreError> {
        self.lock()
            .get(document_id)
            .and_then(|doc| doc.snapshots.last_key_value())
            .map(|(revision, content)| SnapshotRecord {
                document_id: document_id.clone(),
                revision: *revision,
                content: content.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(document_id.clone()))
    }

    fn operations_since(
        &self,
        document_id: &DocumentId,
        revision: u64,
    ) -> Result<Vec<Operation>, StoreError> {
        let Some(first) = revision.checked_add(1) else {
            return Ok(Vec::new());
        };
        Ok(self
            .lock()
            .get(document_id)
            .map(|doc| {
                doc.operations
                    .range((first, Uuid::nil())..)
                    .map(|(_, op)| op.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let mut ids: Vec<DocumentId> = self.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
