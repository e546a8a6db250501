//! Per-document session: the single writer for one document.
//!
//! ```text
//! Connection A ──┐                       ┌──► history queue (async append)
//!                ├─► apply_and_broadcast ┼──► Replica::apply
//! Connection B ──┘    (apply mutex)      ├──► PresenceTable (cursor ops)
//!                                        └──► every other connection's queue
//! ```
//!
//! Everything inside the apply mutex is non-blocking: the replica write lock
//! is held only for the splice, history and fan-out only enqueue. Successive
//! operations are therefore stamped, applied, persisted and delivered in one
//! total order per document.
//!
//! The connection set and presence table sit behind their own `RwLock`s.
//! Broadcast clones the connection set under the read lock and sends from
//! that copy, so connects/disconnects never race an iteration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::connection::{Connection, ConnectionId};
use crate::history::HistorySink;
use crate::operation::{now_nanos, DocumentId, Operation};
use crate::presence::{PresenceEntry, PresenceTable};
use crate::recovery::Recovered;
use crate::replica::Replica;

/// Strictly increasing nanosecond clock for one document.
///
/// Follows wall-clock time but never repeats or goes backwards, so history
/// order (by timestamp) is exactly apply order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalClock {
    last: u64,
}

impl LogicalClock {
    /// Clock whose next tick is greater than `last`.
    pub fn starting_after(last: u64) -> Self {
        Self { last }
    }

    pub fn tick(&mut self) -> u64 {
        self.last = now_nanos().max(self.last.saturating_add(1));
        self.last
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

/// Session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub operations_applied: u64,
    pub broadcasts_delivered: u64,
    pub broadcasts_dropped: u64,
    /// Timestamp of the last applied operation
    pub last_applied: u64,
    /// Revision of the last snapshot written or loaded
    pub last_snapshot: u64,
}

#[derive(Default)]
struct AtomicSessionStats {
    operations_applied: AtomicU64,
    broadcasts_delivered: AtomicU64,
    broadcasts_dropped: AtomicU64,
    last_applied: AtomicU64,
    last_snapshot: AtomicU64,
}

/// Document state handed to a newly joined client.
#[derive(Debug, Clone)]
pub struct JoinState {
    pub text: String,
    pub presence: HashMap<String, PresenceEntry>,
}

/// One open document.
pub struct DocumentSession {
    document_id: DocumentId,
    replica: Replica,
    /// The single mutation path. Guards the clock; holding it orders applies.
    apply_lock: Mutex<LogicalClock>,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    presence: RwLock<PresenceTable>,
    history: HistorySink,
    stats: AtomicSessionStats,
}

impl DocumentSession {
    /// Empty session.
    pub fn new(document_id: DocumentId, history: HistorySink) -> Self {
        Self::with_replica(document_id, Replica::new(), LogicalClock::default(), history)
    }

    /// Session over a replica rebuilt from durable history.
    pub fn from_recovered(document_id: DocumentId, recovered: Recovered, history: HistorySink) -> Self {
        let session = Self::with_replica(
            document_id,
            recovered.replica,
            LogicalClock::starting_after(recovered.last_timestamp),
            history,
        );
        let snapshot = recovered.snapshot_revision.unwrap_or(0);
        session.stats.last_snapshot.store(snapshot, Ordering::Relaxed);
        session
            .stats
            .last_applied
            .store(recovered.last_timestamp, Ordering::Relaxed);
        session
    }

    fn with_replica(
        document_id: DocumentId,
        replica: Replica,
        clock: LogicalClock,
        history: HistorySink,
    ) -> Self {
        Self {
            document_id,
            replica,
            apply_lock: Mutex::new(clock),
            connections: RwLock::new(HashMap::new()),
            presence: RwLock::new(PresenceTable::new()),
            history,
            stats: AtomicSessionStats::default(),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Register a connection. Returns `false` if it was already registered.
    pub async fn add_connection(&self, conn: Connection) -> bool {
        let mut conns = self.connections.write().await;
        let id = conn.id();
        let added = conns.insert(id, conn).is_none();
        if added {
            log::debug!("{id} joined {} ({} connected)", self.document_id, conns.len());
        }
        added
    }

    /// Unregister a connection. Removing an unknown id is a no-op.
    pub async fn remove_connection(&self, id: ConnectionId) -> Option<Connection> {
        let mut conns = self.connections.write().await;
        let removed = conns.remove(&id);
        if removed.is_some() {
            log::debug!("{id} left {} ({} connected)", self.document_id, conns.len());
        }
        removed
    }

    /// Register a connection and capture the state it starts from.
    ///
    /// Taken under the apply mutex: every operation not reflected in the
    /// returned text is queued to the new connection.
    pub async fn join(&self, conn: Connection) -> JoinState {
        let _clock = self.apply_lock.lock().await;
        self.add_connection(conn).await;
        JoinState {
            text: self.replica.read(),
            presence: self.presence.read().await.to_map(),
        }
    }

    /// Apply one operation, persist it asynchronously and fan it out to every
    /// connection except `sender`.
    ///
    /// The document id and timestamp are overwritten by the session. Returns
    /// the number of connections the operation was queued to; per-connection
    /// failures are logged and counted, never returned.
    pub async fn apply_and_broadcast(&self, mut op: Operation, sender: ConnectionId) -> usize {
        let mut clock = self.apply_lock.lock().await;

        op.document_id = self.document_id.clone();
        op.timestamp = clock.tick();

        self.replica.apply(&op);
        if op.is_cursor() {
            self.presence.write().await.apply(&op);
        }
        self.history.append(op.clone());

        self.stats.operations_applied.fetch_add(1, Ordering::Relaxed);
        self.stats.last_applied.store(op.timestamp, Ordering::Relaxed);
        log::trace!(
            "Applied {} at {} on {} from {}",
            op.kind.as_str(),
            op.position,
            self.document_id,
            op.source
        );

        self.broadcast(Arc::new(op), sender).await
    }

    async fn broadcast(&self, op: Arc<Operation>, sender: ConnectionId) -> usize {
        let targets: Vec<Connection> = {
            let conns = self.connections.read().await;
            conns
                .values()
                .filter(|c| c.id() != sender)
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        let mut evicted = Vec::new();
        for conn in &targets {
            match conn.send(op.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.stats.broadcasts_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Dropped {} for {} ({}) on {}, disconnecting: {e}",
                        op.operation_id,
                        conn.id(),
                        conn.user_id(),
                        self.document_id
                    );
                    evicted.push(conn.id());
                }
            }
        }

        // A client that missed an operation has diverged; later offsets would
        // land in the wrong place. Dropping its queue closes the socket so the
        // client rejoins from a fresh init.
        if !evicted.is_empty() {
            let mut conns = self.connections.write().await;
            for id in evicted {
                conns.remove(&id);
            }
        }

        self.stats
            .broadcasts_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Revision and text taken atomically with respect to applies.
    ///
    /// Every operation reflected in the text has a timestamp below the
    /// revision; every later operation is stamped above it.
    pub async fn snapshot_point(&self) -> (u64, String) {
        let mut clock = self.apply_lock.lock().await;
        let revision = clock.tick();
        (revision, self.replica.read())
    }

    /// Record that a snapshot at `revision` is durable.
    pub fn mark_snapshot(&self, revision: u64) {
        self.stats.last_snapshot.fetch_max(revision, Ordering::Relaxed);
    }

    /// Whether operations were applied after the last snapshot.
    pub fn is_dirty(&self) -> bool {
        self.stats.last_applied.load(Ordering::Relaxed) > self.stats.last_snapshot.load(Ordering::Relaxed)
    }

    /// Current text. Concurrent with other reads, never with an apply.
    pub fn text(&self) -> String {
        self.replica.read()
    }

    pub async fn presence(&self) -> HashMap<String, PresenceEntry> {
        self.presence.read().await.to_map()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            operations_applied: self.stats.operations_applied.load(Ordering::Relaxed),
            broadcasts_delivered: self.stats.broadcasts_delivered.load(Ordering::Relaxed),
            broadcasts_dropped: self.stats.broadcasts_dropped.load(Ordering::Relaxed),
            last_applied: self.stats.last_applied.load(Ordering::Relaxed),
            last_snapshot: self.stats.last_snapshot.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryWriter;
    use crate::operation::OperationKind;
    use crate::storage::{DocumentStore, MemoryStore};

    fn doc() -> DocumentId {
        DocumentId::new("session")
    }

    fn session_with_store() -> (Arc<DocumentSession>, Arc<MemoryStore>, HistorySink) {
        let store = Arc::new(MemoryStore::new());
        let (sink, _handle) = HistoryWriter::spawn(store.clone());
        (Arc::new(DocumentSession::new(doc(), sink.clone())), store, sink)
    }

    #[tokio::test]
    async fn test_sender_excluded_from_broadcast() {
        let (session, _store, _sink) = session_with_store();
        let (a, mut rx_a) = Connection::new("alice", 8);
        let (b, mut rx_b) = Connection::new("bob", 8);
        let a_id = a.id();
        session.add_connection(a).await;
        session.add_connection(b).await;

        let delivered = session
            .apply_and_broadcast(Operation::insert(doc(), 0, "hello", "alice"), a_id)
            .await;

        assert_eq!(delivered, 1);
        let got = rx_b.recv().await.unwrap();
        assert_eq!(got.kind, OperationKind::Insert);
        assert_eq!(got.value, "hello");
        assert!(rx_a.try_recv().is_err());
        assert_eq!(session.text(), "hello");
    }

    #[tokio::test]
    async fn test_document_id_forced() {
        let (session, _store, _sink) = session_with_store();
        let (b, mut rx_b) = Connection::new("bob", 8);
        session.add_connection(b).await;

        let op = Operation::insert(DocumentId::new("someone-else"), 0, "x", "alice");
        session.apply_and_broadcast(op, ConnectionId::next()).await;

        assert_eq!(rx_b.recv().await.unwrap().document_id, doc());
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let (session, _store, _sink) = session_with_store();
        let (b, mut rx_b) = Connection::new("bob", 64);
        session.add_connection(b).await;

        for _ in 0..20 {
            let mut op = Operation::insert(doc(), 0, "x", "alice");
            op.timestamp = 1; // client clock ignored
            session.apply_and_broadcast(op, ConnectionId::next()).await;
        }

        let mut last = 0;
        for _ in 0..20 {
            let op = rx_b.recv().await.unwrap();
            assert!(op.timestamp > last);
            last = op.timestamp;
        }
    }

    #[tokio::test]
    async fn test_operations_persisted() {
        let (session, store, sink) = session_with_store();
        session
            .apply_and_broadcast(Operation::insert(doc(), 0, "abc", "u"), ConnectionId::next())
            .await;
        session
            .apply_and_broadcast(Operation::delete(doc(), 0, 1, "u"), ConnectionId::next())
            .await;
        sink.flush().await;

        let ops = store.operations_since(&doc(), 0).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].value, "abc");
        assert_eq!(ops[1].kind, OperationKind::Delete);
    }

    #[tokio::test]
    async fn test_cursor_updates_presence() {
        let (session, _store, _sink) = session_with_store();
        let sender = ConnectionId::next();
        session
            .apply_and_broadcast(Operation::cursor(doc(), 2, "#aa0000", "alice"), sender)
            .await;
        session
            .apply_and_broadcast(Operation::cursor(doc(), 5, "#aa0000", "alice"), sender)
            .await;

        let presence = session.presence().await;
        assert_eq!(presence.len(), 1);
        assert_eq!(presence["alice"].cursor_pos, 5);
        assert_eq!(session.text(), "");
    }

    #[tokio::test]
    async fn test_closed_connection_does_not_block_others() {
        let (session, _store, _sink) = session_with_store();
        let (gone, gone_rx) = Connection::new("gone", 8);
        let (full, _full_rx) = Connection::new("slow", 1);
        let (ok, mut ok_rx) = Connection::new("ok", 8);
        drop(gone_rx);
        full.send(Arc::new(Operation::insert(doc(), 0, "fill", "x"))).unwrap();
        session.add_connection(gone).await;
        session.add_connection(full).await;
        session.add_connection(ok).await;

        let delivered = session
            .apply_and_broadcast(Operation::insert(doc(), 0, "hi", "u"), ConnectionId::next())
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(ok_rx.recv().await.unwrap().value, "hi");
        assert_eq!(session.text(), "hi");
        let stats = session.stats();
        assert_eq!(stats.broadcasts_dropped, 2);
        assert_eq!(stats.broadcasts_delivered, 1);
        assert_eq!(stats.operations_applied, 1);
        assert_eq!(session.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_full_queue_disconnects_client() {
        let (session, _store, _sink) = session_with_store();
        let (slow, mut slow_rx) = Connection::new("slow", 1);
        let (fast, mut fast_rx) = Connection::new("fast", 8);
        session.add_connection(slow).await;
        session.add_connection(fast).await;
        let sender = ConnectionId::next();

        session
            .apply_and_broadcast(Operation::insert(doc(), 0, "abc", "u"), sender)
            .await;
        session
            .apply_and_broadcast(Operation::insert(doc(), 0, "XYZ", "u"), sender)
            .await;
        session
            .apply_and_broadcast(Operation::delete(doc(), 3, 3, "u"), sender)
            .await;

        assert_eq!(session.text(), "XYZ");
        assert_eq!(session.connection_count().await, 1);
        assert_eq!(session.stats().broadcasts_dropped, 1);

        // The slow client gets what was queued, then its queue closes
        assert_eq!(slow_rx.recv().await.unwrap().value, "abc");
        assert!(slow_rx.recv().await.is_none());

        let mut fast_values = Vec::new();
        while let Ok(op) = fast_rx.try_recv() {
            fast_values.push(op.kind);
        }
        assert_eq!(
            fast_values,
            vec![OperationKind::Insert, OperationKind::Insert, OperationKind::Delete]
        );
    }

    #[tokio::test]
    async fn test_add_remove_idempotent() {
        let (session, _store, _sink) = session_with_store();
        let (conn, _rx) = Connection::new("u", 4);
        let id = conn.id();
        assert!(session.add_connection(conn.clone()).await);
        assert!(!session.add_connection(conn).await);
        assert_eq!(session.connection_count().await, 1);

        assert!(session.remove_connection(id).await.is_some());
        assert!(session.remove_connection(id).await.is_none());
        assert_eq!(session.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_returns_current_state() {
        let (session, _store, _sink) = session_with_store();
        let sender = ConnectionId::next();
        session
            .apply_and_broadcast(Operation::insert(doc(), 0, "draft", "alice"), sender)
            .await;
        session
            .apply_and_broadcast(Operation::cursor(doc(), 5, "#00ff00", "alice"), sender)
            .await;

        let (conn, mut rx) = Connection::new("bob", 8);
        let state = session.join(conn).await;
        assert_eq!(state.text, "draft");
        assert_eq!(state.presence["alice"].cursor_pos, 5);
        // Nothing from before the join is queued
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_serialized() {
        let (session, store, sink) = session_with_store();
        let (observer, mut rx) = Connection::new("observer", 1024);
        session.add_connection(observer).await;

        let mut tasks = Vec::new();
        for w in 0..4 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                let me = ConnectionId::next();
                for _ in 0..50 {
                    let op = Operation::insert(doc(), 0, w.to_string(), format!("w{w}"));
                    session.apply_and_broadcast(op, me).await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        sink.flush().await;

        assert_eq!(session.text().chars().count(), 200);

        // The observer and the store agree on a single order, and replaying
        // that order reproduces the live text.
        let mut observed = Vec::new();
        while let Ok(op) = rx.try_recv() {
            observed.push(op.operation_id);
        }
        let stored = store.operations_since(&doc(), 0).unwrap();
        let stored_ids: Vec<_> = stored.iter().map(|o| o.operation_id).collect();
        assert_eq!(observed, stored_ids);

        let replay = Replica::new();
        for op in &stored {
            replay.apply(op);
        }
        assert_eq!(replay.read(), session.text());
    }

    #[tokio::test]
    async fn test_snapshot_point_and_dirty_tracking() {
        let (session, _store, _sink) = session_with_store();
        assert!(!session.is_dirty());

        session
            .apply_and_broadcast(Operation::insert(doc(), 0, "abc", "u"), ConnectionId::next())
            .await;
        assert!(session.is_dirty());

        let (revision, text) = session.snapshot_point().await;
        assert_eq!(text, "abc");
        assert!(revision > session.stats().last_applied);

        session.mark_snapshot(revision);
        assert!(!session.is_dirty());

        session
            .apply_and_broadcast(Operation::insert(doc(), 3, "d", "u"), ConnectionId::next())
            .await;
        assert!(session.is_dirty());
        assert!(session.stats().last_applied > revision);
    }

    #[test]
    fn test_logical_clock_monotonic_past_future_start() {
        let far_future = now_nanos() + 3_600_000_000_000;
        let mut clock = LogicalClock::starting_after(far_future);
        let a = clock.tick();
        let b = clock.tick();
        assert_eq!(a, far_future + 1);
        assert_eq!(b, far_future + 2);
        assert_eq!(clock.last(), b);
    }
}
