//! Durable history for collaborative documents.
//!
//! Two record kinds, both keyed by document:
//! ```text
//! snapshots   (document, revision)               → full text at revision
//! operations  (document, timestamp, operationId) → one accepted operation
//! ```
//!
//! Recovery loads the latest snapshot and replays every operation with a
//! timestamp strictly greater than the snapshot revision, in timestamp order.
//!
//! Backends:
//! - [`RocksStore`]: RocksDB column families, LZ4-compressed snapshots
//! - [`MemoryStore`]: process-local maps, used without a storage path

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{DocumentId, Operation, OperationKind};

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Durable store consumed by the session registry and history writer.
///
/// Calls are synchronous; callers run them off the apply path.
pub trait DocumentStore: Send + Sync {
    /// Append one accepted operation to the document's history.
    fn insert_operation(&self, op: &Operation) -> Result<(), StoreError>;

    /// Record the full text of a document at `revision`.
    fn insert_snapshot(
        &self,
        document_id: &DocumentId,
        revision: u64,
        content: &str,
    ) -> Result<(), StoreError>;

    /// Snapshot with the highest revision, or [`StoreError::NotFound`].
    fn latest_snapshot(&self, document_id: &DocumentId) -> Result<SnapshotRecord, StoreError>;

    /// Operations with `timestamp > revision`, ascending by timestamp.
    fn operations_since(
        &self,
        document_id: &DocumentId,
        revision: u64,
    ) -> Result<Vec<Operation>, StoreError>;

    /// Every document that has a snapshot or operation stored.
    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// Full-text checkpoint of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub document_id: DocumentId,
    /// Logical clock value; every operation folded into `content` has a
    /// smaller timestamp.
    pub revision: u64,
    pub content: String,
}

/// Stored form of an [`Operation`].
///
/// Kept separate from the wire type so the binary encoding does not depend
/// on JSON-only serde attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub document_id: DocumentId,
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub position: i64,
    pub value: String,
    pub timestamp: u64,
    pub source: String,
    pub cursor_position: Option<i64>,
    pub user_color: Option<String>,
}

impl OperationRecord {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

impl From<&Operation> for OperationRecord {
    fn from(op: &Operation) -> Self {
        Self {
            document_id: op.document_id.clone(),
            operation_id: op.operation_id,
            kind: op.kind,
            position: op.position,
            value: op.value.clone(),
            timestamp: op.timestamp,
            source: op.source.clone(),
            cursor_position: op.cursor_position,
            user_color: op.user_color.clone(),
        }
    }
}

impl From<OperationRecord> for Operation {
    fn from(record: OperationRecord) -> Self {
        Self {
            kind: record.kind,
            document_id: record.document_id,
            position: record.position,
            value: record.value,
            operation_id: record.operation_id,
            source: record.source,
            timestamp: record.timestamp,
            cursor_position: record.cursor_position,
            user_color: record.user_color,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend error (RocksDB, or an injected failure)
    DatabaseError(String),
    /// No snapshot stored for the document
    NotFound(DocumentId),
    /// Serialization failed
    SerializationError(String),
    /// Stored bytes could not be decoded
    DeserializationError(String),
    /// LZ4 decompression failed
    CompressionError(String),
    /// Document id cannot be encoded as a key
    InvalidKey(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Snapshot not found for document {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::InvalidKey(e) => write!(f, "Invalid key: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
