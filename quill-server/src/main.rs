//! Quill collaboration server.
//!
//! Configuration comes from the environment (`PORT`, `QUILL_BIND_ADDR`,
//! `QUILL_STORAGE_PATH`, `QUILL_SNAPSHOT_INTERVAL_SECS`,
//! `QUILL_OUTBOUND_CAPACITY`); log level from `RUST_LOG`.

use std::process::ExitCode;
use std::sync::Arc;

use log::info;
use quill_collab::{
    CollabError, DocumentStore, MemoryStore, RocksStore, ServerConfig, SessionRegistry,
    SnapshotScheduler, StoreConfig, SyncServer,
};

fn open_store(config: &ServerConfig) -> Result<Arc<dyn DocumentStore>, CollabError> {
    match &config.storage_path {
        Some(path) => {
            let store = RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?;
            info!("Persisting documents to {}", path.display());
            Ok(Arc::new(store))
        }
        None => {
            log::warn!("No QUILL_STORAGE_PATH set; documents are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), CollabError> {
    let store = open_store(&config)?;
    let registry = Arc::new(SessionRegistry::new(store));
    let scheduler = SnapshotScheduler::spawn(registry.clone(), config.snapshot_interval);
    let server = SyncServer::new(config, registry.clone());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    if let Some(handle) = scheduler {
        handle.abort();
    }
    let stats = server.stats();
    info!(
        "Served {} connections ({} rejected handshakes, {} frames, {} skipped)",
        stats.total_connections,
        stats.rejected_handshakes,
        stats.frames_received,
        stats.frames_rejected
    );

    let written = registry.snapshot_dirty().await;
    registry.history().flush().await;
    info!("Final snapshot of {written} documents written");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    info!("Starting Quill server...");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
