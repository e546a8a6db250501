//! Server configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CollabError;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Per-connection outbound queue capacity, in operations
    pub outbound_capacity: usize,
    /// Interval between periodic snapshots (zero = disabled)
    pub snapshot_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            storage_path: None,
            outbound_capacity: 256,
            snapshot_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `QUILL_*` and `PORT` environment variables.
    pub fn from_env() -> Result<Self, CollabError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// `QUILL_BIND_ADDR` wins over `PORT`; `PORT` alone binds all interfaces.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CollabError> {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            let port: u16 = parse_var("PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(addr) = lookup("QUILL_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("QUILL_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = lookup("QUILL_SNAPSHOT_INTERVAL_SECS") {
            config.snapshot_interval = Duration::from_secs(parse_var("QUILL_SNAPSHOT_INTERVAL_SECS", &secs)?);
        }
        if let Some(capacity) = lookup("QUILL_OUTBOUND_CAPACITY") {
            let capacity: usize = parse_var("QUILL_OUTBOUND_CAPACITY", &capacity)?;
            if capacity == 0 {
                return Err(CollabError::Config("QUILL_OUTBOUND_CAPACITY must be positive".into()));
            }
            config.outbound_capacity = capacity;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, CollabError> {
    value
        .trim()
        .parse()
        .map_err(|_| CollabError::Config(format!("{key}={value:?} is not a valid number")))
}
