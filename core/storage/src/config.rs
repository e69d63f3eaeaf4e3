//! Store backend selection.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::local::LocalStore;
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::store::KeyValueStore;
use fieldsync_common::Result;

/// Which durable store backs the sync core, and where it lives.
///
/// Deserializes from e.g. `{"backend": "sqlite", "path": "/data/fieldsync.db"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Volatile store, lost on exit.
    Memory,
    /// One file per record under `root`.
    Local { root: PathBuf },
    /// Single SQLite database file.
    Sqlite { path: PathBuf },
}

impl StoreConfig {
    /// Backend name, matching the `backend` tag.
    pub fn backend(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::Local { .. } => "local",
            StoreConfig::Sqlite { .. } => "sqlite",
        }
    }

    /// Open the configured store, creating missing directories.
    ///
    /// # Errors
    /// - Directory creation failure
    /// - Backend initialization failure
    pub fn open(&self) -> Result<Arc<dyn KeyValueStore>> {
        let store: Arc<dyn KeyValueStore> = match self {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Local { root } => Arc::new(LocalStore::new(root)?),
            StoreConfig::Sqlite { path } => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Arc::new(SqliteStore::open(path)?)
            }
        };

        info!("Opened {} store", self.backend());
        Ok(store)
    }
}
