//! RocksDB-backed document history.
//!
//! Column families:
//! - `snapshots` : full text per revision (LZ4 compressed)
//! - `operations`: accepted operations (bincode `OperationRecord`)
//! - `metadata`  : per-document counters (bincode `DocumentMetadata`)
//!
//! Key layout:
//! ```text
//! document prefix: ┌───────────┬──────────────────┐
//!                  │ len: u16  │ document id      │
//!                  │ 2 bytes BE│ len bytes (UTF-8)│
//!                  └───────────┴──────────────────┘
//! snapshots:   prefix │ revision: u64 BE
//! operations:  prefix │ timestamp: u64 BE │ operation id: 16 bytes
//! metadata:    prefix
//! ```
//!
//! The length prefix makes every document's keys a contiguous range, and
//! big-endian integers make that range sorted by revision / timestamp.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use super::{DocumentStore, OperationRecord, SnapshotRecord, StoreError};
use crate::operation::{DocumentId, Operation};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPERATIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document counters stored alongside history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    /// Operations appended
    pub operation_count: u64,
    /// Snapshots written
    pub snapshot_count: u64,
    /// Highest snapshot revision written
    pub latest_revision: Option<u64>,
    /// Highest operation timestamp written
    pub last_timestamp: u64,
    /// Creation time (seconds since epoch)
    pub created_at: u64,
    /// Last write time (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: DocumentId) -> Self {
        let now = unix_secs();
        Self {
            document_id,
            operation_count: 0,
            snapshot_count: 0,
            latest_revision: None,
            last_timestamp: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB document store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write between the history writer
    /// and snapshot callers.
    metadata_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            metadata_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Contents are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_OPERATIONS => {
                // Many small appends, range-scanned during recovery
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load document metadata.
    pub fn load_metadata(&self, document_id: &DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let key = document_prefix(document_id)?;
        match self.db.get_cf(&cf, &key)? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id.clone())),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn update_metadata(
        &self,
        batch: &mut WriteBatch,
        document_id: &DocumentId,
        update: impl FnOnce(&mut DocumentMetadata),
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut meta = match self.load_metadata(document_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(document_id.clone()),
            Err(e) => return Err(e),
        };
        update(&mut meta);
        meta.updated_at = unix_secs();
        batch.put_cf(&cf, document_prefix(document_id)?, meta.encode()?);
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    fn insert_operation(&self, op: &Operation) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = document_prefix(&op.document_id)?;
        let mut key = time_key(&prefix, op.timestamp);
        key.extend_from_slice(op.operation_id.as_bytes());
        let value = OperationRecord::from(op).encode()?;

        let _guard = self.metadata_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &value);
        self.update_metadata(&mut batch, &op.document_id, |meta| {
            meta.operation_count += 1;
            meta.last_timestamp = meta.last_timestamp.max(op.timestamp);
        })?;
        self.write(batch)
    }

    fn insert_snapshot(
        &self,
        document_id: &DocumentId,
        revision: u64,
        content: &str,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = document_prefix(document_id)?;
        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());

        let _guard = self.metadata_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, time_key(&prefix, revision), &compressed);
        self.update_metadata(&mut batch, document_id, |meta| {
            meta.snapshot_count += 1;
            meta.latest_revision = Some(meta.latest_revision.map_or(revision, |r| r.max(revision)));
        })?;
        self.write(batch)?;

        log::debug!(
            "Stored snapshot of {document_id} at revision {revision} ({} → {} bytes)",
            content.len(),
            compressed.len()
        );
        Ok(())
    }

    fn latest_snapshot(&self, document_id: &DocumentId) -> Result<SnapshotRecord, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = document_prefix(document_id)?;
        let upper = time_key(&prefix, u64::MAX);

        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                    return Err(StoreError::NotFound(document_id.clone()));
                }
                let revision = read_u64(&key[prefix.len()..])?;
                let bytes = lz4_flex::decompress_size_prepended(&value)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                let content = String::from_utf8(bytes)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(SnapshotRecord {
                    document_id: document_id.clone(),
                    revision,
                    content,
                })
            }
            None => Err(StoreError::NotFound(document_id.clone())),
        }
    }

    fn operations_since(
        &self,
        document_id: &DocumentId,
        revision: u64,
    ) -> Result<Vec<Operation>, StoreError> {
        let Some(first) = revision.checked_add(1) else {
            return Ok(Vec::new());
        };
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = document_prefix(document_id)?;
        let start = time_key(&prefix, first);

        let mut ops = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            ops.push(OperationRecord::decode(&value)?.into());
        }
        Ok(ops)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            ids.push(DocumentMetadata::decode(&value)?.document_id);
        }
        Ok(ids)
    }
}

/// Length-prefixed document key.
fn document_prefix(document_id: &DocumentId) -> Result<Vec<u8>, StoreError> {
    let bytes = document_id.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| StoreError::InvalidKey(format!("document id of {} bytes", bytes.len())))?;
    let mut key = Vec::with_capacity(2 + bytes.len() + 8 + 16);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(bytes);
    Ok(key)
}

fn time_key(prefix: &[u8], value: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8 + 16);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&value.to_be_bytes());
    key
}

fn read_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::DeserializationError("truncated key".into()))?;
    Ok(u64::from_be_bytes(buf))
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
