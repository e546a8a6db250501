//! Fire-and-forget persistence of accepted operations.
//!
//! ```text
//! DocumentSession ──append──► unbounded mpsc ──► HistoryWriter task ──► DocumentStore
//!                                                      │
//!                                                      └── failures → log::error! + counter
//! ```
//!
//! The apply path only enqueues; a slow or failing store never blocks or
//! fails live editing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::operation::Operation;
use crate::storage::DocumentStore;

enum HistoryCommand {
    Append(Operation),
    Flush(oneshot::Sender<()>),
}

/// Persistence counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryStats {
    pub persisted: u64,
    pub failed: u64,
}

#[derive(Default)]
struct AtomicHistoryStats {
    persisted: AtomicU64,
    failed: AtomicU64,
}

/// Sending half of the history queue. Cheap to clone.
#[derive(Clone)]
pub struct HistorySink {
    tx: mpsc::UnboundedSender<HistoryCommand>,
    stats: Arc<AtomicHistoryStats>,
}

impl HistorySink {
    /// Enqueue an operation for durable append. Never blocks.
    pub fn append(&self, op: Operation) {
        if let Err(mpsc::error::SendError(HistoryCommand::Append(op))) =
            self.tx.send(HistoryCommand::Append(op))
        {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "History writer stopped; operation {} on {} not persisted",
                op.operation_id,
                op.document_id
            );
        }
    }

    /// Wait until every operation enqueued before this call has been
    /// attempted. Returns immediately if the writer has stopped.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(HistoryCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

/// Background task appending operations to a [`DocumentStore`].
pub struct HistoryWriter;

impl HistoryWriter {
    /// Start the writer on the current tokio runtime.
    ///
    /// The task ends once every [`HistorySink`] clone has been dropped and
    /// the queue is drained.
    pub fn spawn(store: Arc<dyn DocumentStore>) -> (HistorySink, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicHistoryStats::default());
        let handle = tokio::spawn(Self::run(store, rx, stats.clone()));
        (HistorySink { tx, stats }, handle)
    }

    async fn run(
        store: Arc<dyn DocumentStore>,
        mut rx: mpsc::UnboundedReceiver<HistoryCommand>,
        stats: Arc<AtomicHistoryStats>,
    ) {
        while let Some(command) = rx.recv().await {
            match command {
                HistoryCommand::Append(op) => match Self::persist(&store, op.clone()).await {
                    Ok(()) => {
                        stats.persisted.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Persisted operation {} on {}", op.operation_id, op.document_id);
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        log::error!(
                            "Failed to persist operation {} on {}: {e}",
                            op.operation_id,
                            op.document_id
                        );
                    }
                },
                HistoryCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        log::debug!("History writer stopped");
    }

    /// Append off the runtime threads; the store call may block on disk.
    async fn persist(store: &Arc<dyn DocumentStore>, op: Operation) -> Result<(), String> {
        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.insert_operation(&op)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}
