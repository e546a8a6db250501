//! # quill-collab: real-time collaborative plain-text editing
//!
//! Many clients edit the same document over WebSockets. The server holds one
//! authoritative replica per document, applies every edit in a single total
//! order, fans each accepted edit out to the other clients and appends it to
//! a durable history. A restarted server rebuilds any document from its
//! latest snapshot plus the history after it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  /ws/{docId}  ┌────────────┐  ensure_session  ┌─────────────────┐
//! │ client A/B │ ◄───────────► │ SyncServer │ ───────────────► │ SessionRegistry │
//! └────────────┘   JSON ops    └─────┬──────┘                  └───────┬─────────┘
//!                                    │ apply_and_broadcast             │ recover (once)
//!                                    ▼                                 ▼
//!                         ┌─────────────────────┐            ┌─────────────────┐
//!                         │ DocumentSession     │            │ DocumentStore   │
//!                         │  Replica + presence │──history──►│ (RocksDB/memory)│
//!                         │  connections        │            └─────────────────┘
//!                         └─────────────────────┘
//! ```
//!
//! Convergence comes from the single apply path, not from a merge algorithm:
//! positions are plain character offsets into whatever text exists when the
//! operation arrives.
//!
//! ## Modules
//!
//! - [`operation`]: Operation model and document ids
//! - [`replica`]: In-memory text with clamped insert/delete
//! - [`session`]: Per-document apply + fan-out
//! - [`registry`]: Document id → session, recovered exactly once
//! - [`recovery`]: Snapshot + history replay
//! - [`storage`]: Durable history (RocksDB, in-memory)
//! - [`server`]: WebSocket transport

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod replica;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId, TransportError};
pub use error::CollabError;
pub use history::{HistorySink, HistoryStats, HistoryWriter};
pub use operation::{DocumentId, Operation, OperationKind};
pub use presence::{color_for_user, PresenceEntry, PresenceTable};
pub use protocol::{ConnectRequest, ProtocolError, ServerMessage};
pub use recovery::{recover, Recovered};
pub use registry::SessionRegistry;
pub use replica::Replica;
pub use scheduler::SnapshotScheduler;
pub use server::{ServerStats, SyncServer};
pub use session::{DocumentSession, JoinState, LogicalClock, SessionStats};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, RocksStore, SnapshotRecord, StoreConfig,
    StoreError,
};
