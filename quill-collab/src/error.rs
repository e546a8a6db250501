//! Library-level error type.

use crate::operation::DocumentId;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced to callers of the session registry and server.
///
/// Input anomalies (out-of-range positions, overlong deletes) never appear
/// here; the replica clamps them. Persistence failures during live editing
/// are logged by the history writer and never appear here either.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No session loaded for document {0}")]
    SessionNotFound(DocumentId),

    #[error("Invalid document id: {0}")]
    InvalidDocumentId(String),

    #[error("Recovery task failed for document {document_id}: {reason}")]
    RecoveryFailed {
        document_id: DocumentId,
        reason: String,
    },

    #[error("Storage task failed: {0}")]
    StorageTask(#[from] tokio::task::JoinError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
