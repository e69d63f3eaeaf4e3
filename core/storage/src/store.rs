//! Key/value store trait definition.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use fieldsync_common::{Result, StoreKey};

/// Durable key/value store for FieldSync state.
///
/// Implementations must survive process restarts (except the in-memory one,
/// which exists for tests) and must replace a record atomically on `set`.
/// Concurrent writers to the same key are not coordinated here; callers that
/// do read-modify-write cycles serialize them themselves.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local", "sqlite").
    fn name(&self) -> &str;

    /// Read a record.
    ///
    /// # Returns
    /// - `Ok(None)` if the key has never been written or was deleted
    ///
    /// # Errors
    /// - Backend I/O failure
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>>;

    /// Write a record, replacing any previous value.
    ///
    /// # Postconditions
    /// - A later `get` for the same key returns `value`, including after restart
    ///
    /// # Errors
    /// - Backend I/O failure
    async fn set(&self, key: &StoreKey, value: Vec<u8>) -> Result<()>;

    /// Delete a record. Deleting a missing key is not an error.
    async fn delete(&self, key: &StoreKey) -> Result<()>;

    /// List stored keys, optionally restricted to a namespace.
    async fn keys(&self, namespace: Option<&str>) -> Result<Vec<StoreKey>>;

    /// Check if a key exists.
    async fn exists(&self, key: &StoreKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Read a JSON record and decode it.
///
/// # Errors
/// - Backend failure
/// - `Error::Serialization` if the stored bytes do not decode as `T`
pub async fn get_json<T, S>(store: &S, key: &StoreKey) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: KeyValueStore + ?Sized,
{
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode a value as JSON and write it.
pub async fn set_json<T, S>(store: &S, key: &StoreKey, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    S: KeyValueStore + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes).await
}

/// Whether a key belongs to the given namespace filter.
pub(crate) fn in_namespace(key: &StoreKey, namespace: Option<&str>) -> bool {
    match namespace {
        Some(ns) => key.namespace() == Some(ns),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use fieldsync_common::Error;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        label: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        let key = StoreKey::new("test:marker").unwrap();
        let marker = Marker {
            label: "a".to_string(),
            count: 2,
        };

        set_json(&store, &key, &marker).await.unwrap();
        let loaded: Option<Marker> = get_json(&store, &key).await.unwrap();
        assert_eq!(loaded, Some(marker));
    }

    #[tokio::test]
    async fn test_get_json_corrupt_record() {
        let store = MemoryStore::new();
        let key = StoreKey::new("test:marker").unwrap();
        store.set(&key, b"{not json".to_vec()).await.unwrap();

        let loaded: Result<Option<Marker>> = get_json(&store, &key).await;
        assert!(matches!(loaded, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_namespace_filter() {
        let key = StoreKey::new("cache:jobs").unwrap();
        assert!(in_namespace(&key, None));
        assert!(in_namespace(&key, Some("cache")));
        assert!(!in_namespace(&key, Some("sync")));
    }
}
