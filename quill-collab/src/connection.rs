//! Client handles held by a document session.
//!
//! A [`Connection`] is the session's view of one transport connection: an
//! id, the authenticated user, and a bounded outbound queue. The transport
//! task owns the receiving half and writes queued operations to the socket.
//! Enqueueing never waits, so a slow socket cannot stall the session.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::operation::Operation;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection delivery failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Outbound queue is full; the client is not keeping up
    QueueFull,
    /// Receiving side dropped; the client is gone
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::QueueFull => write!(f, "Outbound queue full"),
            TransportError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Handle for sending operations to one client.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    outbound: mpsc::Sender<Arc<Operation>>,
}

impl Connection {
    /// Create a handle with a fresh id and an outbound queue of `capacity`.
    pub fn new(
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<Operation>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: ConnectionId::next(),
            user_id: user_id.into(),
            outbound,
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue one operation for this client without waiting.
    pub fn send(&self, op: Arc<Operation>) -> Result<(), TransportError> {
        self.outbound.try_send(op).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}
