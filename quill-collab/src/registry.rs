//! Document id → session map with exactly-once recovery.
//!
//! Each id maps to a shared `OnceCell`. The first caller to reach an empty
//! cell runs recovery; every concurrent caller for the same id waits on that
//! cell and receives the same session. Callers for other ids are never held
//! behind it, since the map lock is released before recovery starts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

use crate::error::CollabError;
use crate::history::{HistorySink, HistoryWriter};
use crate::operation::DocumentId;
use crate::recovery;
use crate::session::DocumentSession;
use crate::storage::DocumentStore;

type SessionCell = Arc<OnceCell<Arc<DocumentSession>>>;

/// Owns every live document session.
pub struct SessionRegistry {
    store: Arc<dyn DocumentStore>,
    history: HistorySink,
    sessions: RwLock<HashMap<DocumentId, SessionCell>>,
    recoveries: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry over `store` and start its history writer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let (history, _writer) = HistoryWriter::spawn(store.clone());
        Self {
            store,
            history,
            sessions: RwLock::new(HashMap::new()),
            recoveries: AtomicU64::new(0),
        }
    }

    /// Return the live session for `document_id`, recovering it from the
    /// store on first use.
    ///
    /// On recovery failure the cell stays empty and stays in the map, so the
    /// next waiter (or the next call) retries on the same cell.
    pub async fn ensure_session(
        &self,
        document_id: &DocumentId,
    ) -> Result<Arc<DocumentSession>, CollabError> {
        let cell = self.cell_for(document_id).await;
        cell.get_or_try_init(|| self.recover_session(document_id.clone()))
            .await
            .cloned()
    }

    async fn cell_for(&self, document_id: &DocumentId) -> SessionCell {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(cell) = sessions.get(document_id) {
                return cell.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(document_id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    async fn recover_session(
        &self,
        document_id: DocumentId,
    ) -> Result<Arc<DocumentSession>, CollabError> {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();
        let id = document_id.clone();
        let recovered = tokio::task::spawn_blocking(move || recovery::recover(store.as_ref(), &id))
            .await
            .map_err(|e| CollabError::RecoveryFailed {
                document_id: document_id.clone(),
                reason: e.to_string(),
            })?
            .inspect_err(|e| log::error!("Recovery of {document_id} failed: {e}"))?;

        log::info!(
            "Opened session for {document_id} ({} chars, {} operations replayed)",
            recovered.replica.len(),
            recovered.replayed
        );
        Ok(Arc::new(DocumentSession::from_recovered(
            document_id,
            recovered,
            self.history.clone(),
        )))
    }

    /// The live session for `document_id`, if one has been loaded.
    pub async fn get(&self, document_id: &DocumentId) -> Option<Arc<DocumentSession>> {
        self.sessions
            .read()
            .await
            .get(document_id)
            .and_then(|cell| cell.get().cloned())
    }

    /// Write a snapshot of a loaded document. Returns its revision.
    pub async fn take_snapshot(&self, document_id: &DocumentId) -> Result<u64, CollabError> {
        let session = self
            .get(document_id)
            .await
            .ok_or_else(|| CollabError::SessionNotFound(document_id.clone()))?;
        self.snapshot_session(&session).await
    }

    async fn snapshot_session(&self, session: &DocumentSession) -> Result<u64, CollabError> {
        let (revision, text) = session.snapshot_point().await;
        let chars = text.chars().count();
        let store = self.store.clone();
        let id = session.document_id().clone();
        tokio::task::spawn_blocking(move || store.insert_snapshot(&id, revision, &text))
            .await??;
        session.mark_snapshot(revision);
        log::debug!(
            "Snapshot of {} at revision {revision} ({chars} chars)",
            session.document_id()
        );
        Ok(revision)
    }

    /// Snapshot every session with operations applied since its last
    /// snapshot. Failures are logged and skipped; returns how many succeeded.
    pub async fn snapshot_dirty(&self) -> usize {
        let mut written = 0;
        for session in self.sessions().await {
            if !session.is_dirty() {
                continue;
            }
            match self.snapshot_session(&session).await {
                Ok(_) => written += 1,
                Err(e) => log::error!("Snapshot of {} failed: {e}", session.document_id()),
            }
        }
        written
    }

    async fn sessions(&self) -> Vec<Arc<DocumentSession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Ids of every loaded document, sorted.
    pub async fn document_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .sessions()
            .await
            .iter()
            .map(|s| s.document_id().clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn session_count(&self) -> usize {
        self.sessions().await.len()
    }

    /// Number of recoveries started since creation.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    pub fn history(&self) -> &HistorySink {
        &self.history
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}
