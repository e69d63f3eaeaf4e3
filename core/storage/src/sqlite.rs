//! SQLite-backed key/value store.
//!
//! Keeps every record in a single table so the queue and the cache share one
//! database file on device.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::store::{in_namespace, KeyValueStore};
use fieldsync_common::{Error, Result, StoreKey};

/// SQLite key/value store.
///
/// The connection is guarded by a mutex and every statement runs on the
/// blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn sqlite_err(e: rusqlite::Error) -> Error {
    Error::Storage(format!("SQLite: {}", e))
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(sqlite_err)?;
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_records (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sqlite_err)?;

        info!("SQLite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("SQLite task failed: {}", e)))?
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let key = key.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_records WHERE key = ?1",
                [key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(sqlite_err)
        })
        .await
    }

    async fn set(&self, key: &StoreKey, value: Vec<u8>) -> Result<()> {
        let key = key.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO kv_records (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                "#,
                params![key, value, Utc::now().timestamp_millis()],
            )
            .map(|_| ())
            .map_err(sqlite_err)
        })
        .await
    }

    async fn delete(&self, key: &StoreKey) -> Result<()> {
        let key = key.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv_records WHERE key = ?1", [key])
                .map(|_| ())
                .map_err(sqlite_err)
        })
        .await
    }

    async fn keys(&self, namespace: Option<&str>) -> Result<Vec<StoreKey>> {
        let raw: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT key FROM kv_records ORDER BY key")
                    .map_err(sqlite_err)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(sqlite_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(sqlite_err)
            })
            .await?;

        let mut keys = Vec::with_capacity(raw.len());
        for k in raw {
            let key = StoreKey::new(k)?;
            if in_namespace(&key, namespace) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
