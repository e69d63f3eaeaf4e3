//! In-memory key/value store for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::store::{in_namespace, KeyValueStore};
use fieldsync_common::{Error, Result, StoreKey};

#[derive(Default)]
struct Inner {
    records: RwLock<BTreeMap<StoreKey, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

/// In-memory key/value store.
///
/// Useful for testing and development. Clones share the same records, so a
/// clone handed to a fresh context behaves like the same device after a
/// process restart. Reads and writes can be made to fail on demand to
/// exercise persistence-failure paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail with a storage error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write or delete fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.inner.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_read(&self) -> Result<()> {
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Storage("Injected read failure".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("Injected write failure".to_string()));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("Memory store lock poisoned".to_string())
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        self.check_read()?;
        let records = self.inner.records.read().map_err(poisoned)?;
        Ok(records.get(key).cloned())
    }

    async fn set(&self, key: &StoreKey, value: Vec<u8>) -> Result<()> {
        self.check_write()?;
        let mut records = self.inner.records.write().map_err(poisoned)?;
        records.insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<()> {
        self.check_write()?;
        let mut records = self.inner.records.write().map_err(poisoned)?;
        records.remove(key);
        Ok(())
    }

    async fn keys(&self, namespace: Option<&str>) -> Result<Vec<StoreKey>> {
        self.check_read()?;
        let records = self.inner.records.read().map_err(poisoned)?;
        Ok(records
            .keys()
            .filter(|k| in_namespace(k, namespace))
            .cloned()
            .collect())
    }
}
