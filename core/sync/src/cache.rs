//! Read-through cache of remote entity collections.
//!
//! Read paths never fail: a missing record, a record that no longer decodes,
//! or a backend read error all produce the empty default and a warning.
//! Write paths propagate the store error to the caller.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use fieldsync_common::types::NAMESPACE_SEPARATOR;
use fieldsync_common::{Result, StoreKey};
use fieldsync_storage::{get_json, set_json, KeyValueStore};

/// Namespace of cached entity collections.
pub const CACHE_NAMESPACE: &str = "cache";

/// Namespace of records written through the generic `get`/`set`/`delete`.
pub const RECORD_NAMESPACE: &str = "kv";

/// Namespace of sync metadata records.
pub const SYNC_NAMESPACE: &str = "sync";

const LAST_SYNC: &str = "last_sync";

/// A cached collection together with the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot<T> {
    /// Items in the order the remote returned them.
    pub items: Vec<T>,
    /// When this snapshot replaced the previous one.
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct SnapshotRecord<'a, T> {
    items: &'a [T],
    last_updated_at: DateTime<Utc>,
}

/// Durable cache of entity collections and sync metadata.
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
}

impl CacheStore {
    /// Create a cache over a key/value store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Read and decode an arbitrary record.
    ///
    /// Generic records live in their own namespace and never alias the
    /// queue, entity snapshots or sync metadata.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let key = match record_key(key) {
            Ok(key) => key,
            Err(e) => {
                warn!("Cache read with invalid key {:?}: {}", key, e);
                return None;
            }
        };
        self.read(&key).await
    }

    /// Encode and write an arbitrary record.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let key = record_key(key)?;
        set_json(self.store.as_ref(), &key, value).await
    }

    /// Delete a record.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let key = record_key(key)?;
        self.store.delete(&key).await
    }

    /// Replace the cached collection for `kind`.
    ///
    /// Returns the timestamp stamped on the snapshot.
    pub async fn cache_entities<T: Serialize>(
        &self,
        kind: &str,
        items: &[T],
    ) -> Result<DateTime<Utc>> {
        let key = StoreKey::namespaced(CACHE_NAMESPACE, kind)?;
        let last_updated_at = Utc::now();
        let record = SnapshotRecord {
            items,
            last_updated_at,
        };

        set_json(self.store.as_ref(), &key, &record).await?;
        debug!("Cached {} {} entities", items.len(), kind);
        Ok(last_updated_at)
    }

    /// Cached collection for `kind`, empty if never cached.
    pub async fn get_cached_entities<T: DeserializeOwned>(&self, kind: &str) -> Vec<T> {
        self.get_snapshot(kind)
            .await
            .map(|s| s.items)
            .unwrap_or_default()
    }

    /// Cached collection for `kind` with its timestamp.
    pub async fn get_snapshot<T: DeserializeOwned>(&self, kind: &str) -> Option<CachedSnapshot<T>> {
        let key = match StoreKey::namespaced(CACHE_NAMESPACE, kind) {
            Ok(key) => key,
            Err(e) => {
                warn!("Cache read for invalid kind {:?}: {}", kind, e);
                return None;
            }
        };
        self.read(&key).await
    }

    /// Entity kinds that currently have a cached snapshot.
    pub async fn cached_kinds(&self) -> Vec<String> {
        match self.store.keys(Some(CACHE_NAMESPACE)).await {
            Ok(keys) => keys
                .iter()
                .filter_map(|k| {
                    k.as_str()
                        .split_once(NAMESPACE_SEPARATOR)
                        .map(|(_, kind)| kind.to_string())
                })
                .collect(),
            Err(e) => {
                warn!("Failed to list cached kinds: {}", e);
                Vec::new()
            }
        }
    }

    /// Time the last sync pass finished, if any.
    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        let key = last_sync_key().ok()?;
        self.read(&key).await
    }

    /// Record the time a sync pass finished.
    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        set_json(self.store.as_ref(), &last_sync_key()?, &at).await
    }

    async fn read<T: DeserializeOwned>(&self, key: &StoreKey) -> Option<T> {
        match get_json(self.store.as_ref(), key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring unreadable cache record {}: {}", key, e);
                None
            }
        }
    }
}

fn record_key(key: &str) -> Result<StoreKey> {
    StoreKey::namespaced(RECORD_NAMESPACE, key)
}

fn last_sync_key() -> Result<StoreKey> {
    StoreKey::namespaced(SYNC_NAMESPACE, LAST_SYNC)
}
