//! Local filesystem key/value store.

use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{in_namespace, KeyValueStore};
use fieldsync_common::{Error, Result, StoreKey};

/// Suffix of in-flight temporary files.
const TEMP_SUFFIX: &str = ".tmp";

/// Longest encoded key stored under its own name. Leaves room for the
/// temporary-file decoration within a 255-byte file name.
const MAX_PLAIN_NAME: usize = 160;

/// Prefix of digest-named record files. Never produced by the encoder.
const HASHED_PREFIX: char = '~';

/// File holding one record.
struct RecordFile {
    name: String,
    /// The file starts with the key and a newline.
    hashed: bool,
}

impl RecordFile {
    fn for_key(key: &StoreKey) -> Self {
        let encoded = utf8_percent_encode(key.as_str(), NON_ALPHANUMERIC).to_string();
        if encoded.len() <= MAX_PLAIN_NAME {
            return Self {
                name: encoded,
                hashed: false,
            };
        }

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(key.as_str().as_bytes());
        let name = hasher.finalize().iter().fold(
            String::from(HASHED_PREFIX),
            |mut name, byte| {
                name.push_str(&format!("{:02x}", byte));
                name
            },
        );
        Self { name, hashed: true }
    }
}

/// Split a digest-named file into its key and value.
fn split_header(data: &[u8]) -> Option<(&str, &[u8])> {
    let newline = data.iter().position(|b| *b == b'\n')?;
    let key = std::str::from_utf8(&data[..newline]).ok()?;
    Some((key, &data[newline + 1..]))
}

/// Local filesystem key/value store.
///
/// Stores one file per key inside a root directory. File names are the
/// percent-encoded key; keys whose encoding is too long for a file name are
/// stored under a BLAKE2b digest with the key as the file's first line.
/// Writes go to a temporary file which is fsynced and renamed over the
/// target, which makes each `set` atomic.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Invalid path
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Sync for constructor
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn temp_path(&self, file: &RecordFile) -> PathBuf {
        self.root
            .join(format!(".{}.{}{}", file.name, Uuid::new_v4(), TEMP_SUFFIX))
    }

    async fn read_header_key(&self, name: &str) -> Option<String> {
        let data = match fs::read(self.root.join(name)).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping unreadable record file {}: {}", name, e);
                return None;
            }
        };
        match split_header(&data) {
            Some((key, _)) => Some(key.to_string()),
            None => {
                warn!("Skipping record file without key header: {}", name);
                None
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let file = RecordFile::for_key(key);
        let data = match fs::read(self.root.join(&file.name)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !file.hashed {
            return Ok(Some(data));
        }
        match split_header(&data) {
            Some((stored, value)) if stored == key.as_str() => Ok(Some(value.to_vec())),
            Some((stored, _)) => Err(Error::Storage(format!(
                "Record file {} holds {}, not {}",
                file.name, stored, key
            ))),
            None => Err(Error::Storage(format!(
                "Record file {} has no key header",
                file.name
            ))),
        }
    }

    async fn set(&self, key: &StoreKey, value: Vec<u8>) -> Result<()> {
        let record = RecordFile::for_key(key);
        let target = self.root.join(&record.name);
        let temp = self.temp_path(&record);

        let mut file = fs::File::create(&temp).await?;
        let written = async {
            if record.hashed {
                file.write_all(key.as_str().as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            file.write_all(&value).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        drop(file);

        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!("Wrote {} bytes to {}", value.len(), key);
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<()> {
        match fs::remove_file(self.root.join(RecordFile::for_key(key).name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, namespace: Option<&str>) -> Result<Vec<StoreKey>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') || name.ends_with(TEMP_SUFFIX) {
                continue;
            }

            let decoded = if name.starts_with(HASHED_PREFIX) {
                match self.read_header_key(name).await {
                    Some(key) => key,
                    None => continue,
                }
            } else {
                match percent_decode_str(name).decode_utf8() {
                    Ok(decoded) => decoded.into_owned(),
                    Err(_) => {
                        warn!("Skipping undecodable record file: {}", name);
                        continue;
                    }
                }
            };

            match StoreKey::new(decoded) {
                Ok(key) if in_namespace(&key, namespace) => keys.push(key),
                Ok(_) => {}
                Err(e) => warn!("Skipping record file {}: {}", name, e),
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(s: &str) -> StoreKey {
        StoreKey::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_local_set_get() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.set(&key("cache:jobs"), b"[1,2,3]".to_vec()).await.unwrap();
        assert_eq!(
            store.get(&key("cache:jobs")).await.unwrap(),
            Some(b"[1,2,3]".to_vec())
        );
        assert_eq!(store.get(&key("cache:other")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = LocalStore::new(temp.path()).unwrap();
            store.set(&key("pending_actions"), vec![9, 9]).await.unwrap();
        }

        let reopened = LocalStore::new(temp.path()).unwrap();
        assert_eq!(
            reopened.get(&key("pending_actions")).await.unwrap(),
            Some(vec![9, 9])
        );
    }

    #[tokio::test]
    async fn test_local_keys_skip_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.set(&key("cache:jobs"), vec![1]).await.unwrap();
        store.set(&key("sync:last_sync"), vec![2]).await.unwrap();
        std::fs::write(temp.path().join(".leftover.tmp"), b"x").unwrap();

        assert_eq!(store.keys(None).await.unwrap().len(), 2);
        assert_eq!(
            store.keys(Some("cache")).await.unwrap(),
            vec![key("cache:jobs")]
        );
    }

    #[tokio::test]
    async fn test_local_long_keys_fit_in_file_names() {
        let temp = TempDir::new().unwrap();
        let long = key(&format!("cache:{}", "work-orders/".repeat(20)));
        let other = key(&format!("cache:{}", "work-orders/".repeat(19)));

        {
            let store = LocalStore::new(temp.path()).unwrap();
            store.set(&long, b"[1,2]".to_vec()).await.unwrap();
            store.set(&other, b"[3]".to_vec()).await.unwrap();
            store.set(&key("cache:jobs"), b"[]".to_vec()).await.unwrap();
        }

        for entry in std::fs::read_dir(temp.path()).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(name.len() <= MAX_PLAIN_NAME.max(65));
        }

        let store = LocalStore::new(temp.path()).unwrap();
        assert_eq!(store.get(&long).await.unwrap(), Some(b"[1,2]".to_vec()));
        assert_eq!(store.get(&other).await.unwrap(), Some(b"[3]".to_vec()));

        let mut expected = vec![key("cache:jobs"), long.clone(), other.clone()];
        expected.sort();
        assert_eq!(store.keys(Some("cache")).await.unwrap(), expected);

        store.delete(&long).await.unwrap();
        assert_eq!(store.get(&long).await.unwrap(), None);
        assert_eq!(store.keys(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_local_longest_key_of_symbols() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();
        let symbols = key(&"/".repeat(fieldsync_common::types::MAX_KEY_LEN));

        store.set(&symbols, vec![7]).await.unwrap();
        assert_eq!(store.get(&symbols).await.unwrap(), Some(vec![7]));
        assert_eq!(store.keys(None).await.unwrap(), vec![symbols]);
    }

    #[tokio::test]
    async fn test_local_delete() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.set(&key("a/b"), vec![1]).await.unwrap();
        store.delete(&key("a/b")).await.unwrap();
        store.delete(&key("a/b")).await.unwrap();
        assert!(!store.exists(&key("a/b")).await.unwrap());
    }
}
