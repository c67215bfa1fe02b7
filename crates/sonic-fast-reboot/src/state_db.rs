//! Key-value state store abstraction.
//!
//! The orchestrator only needs a handful of hash operations on STATE_DB
//! (handshake record, restart intent flags) and ASIC_DB (snapshot source).
//! [`StateStore`] captures exactly that surface; [`MemoryStateStore`] backs
//! tests and dry runs, `RedisStateStore` backs production.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::StoreError;

/// Current dump file format version.
pub const DUMP_FORMAT_VERSION: u32 = 1;

/// Hash entries keyed by store key.
pub type Entries = BTreeMap<String, BTreeMap<String, String>>;

/// Operations the orchestrator performs on a state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Database name for logging (e.g. STATE_DB).
    fn name(&self) -> &str;

    /// Reads one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Reads a whole hash. Missing keys read as empty.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Writes hash fields.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    /// Lists every key.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Deletes keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Writes the full current contents to the store's dump file and returns its path.
    async fn persist(&self) -> Result<PathBuf, StoreError>;

    /// Removes every key.
    async fn flush(&self) -> Result<(), StoreError>;

    /// Change notifications, if the backend supports them.
    ///
    /// The value is a write counter; waiters only care that it changed.
    fn watch(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// On-disk dump written by [`StateStore::persist`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDump {
    /// Format version.
    pub version: u32,
    /// Source database name.
    pub db: String,
    /// RFC 3339 time the dump was taken.
    pub saved_at: String,
    /// Dumped hashes.
    pub entries: Entries,
}

impl StoreDump {
    /// Creates a dump of `entries` stamped with the current time.
    pub fn new(db: impl Into<String>, entries: Entries) -> Self {
        Self {
            version: DUMP_FORMAT_VERSION,
            db: db.into(),
            saved_at: chrono::Utc::now().to_rfc3339(),
            entries,
        }
    }

    /// Writes the dump, creating parent directories as needed.
    pub fn write_to(&self, path: &Path) -> Result<(), StoreError> {
        let dump_err = |source| StoreError::Dump {
            db: self.db.clone(),
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(dump_err)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| StoreError::Serialization {
            db: self.db.clone(),
            message: e.to_string(),
        })?;
        fs::write(path, json).map_err(dump_err)
    }

    /// Reads a dump file.
    pub fn read_from(path: &Path) -> Result<Self, StoreError> {
        let bytes = fs::read(path).map_err(|source| StoreError::Dump {
            db: "dump".to_string(),
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
            db: "dump".to_string(),
            message: format!("{}: {}", path.display(), e),
        })
    }
}

/// In-process state store.
///
/// Clones share the same data, so a test can hold one handle while the
/// orchestrator writes through another.
#[derive(Clone)]
pub struct MemoryStateStore {
    name: String,
    dump_path: PathBuf,
    data: Arc<Mutex<Entries>>,
    changes: Arc<watch::Sender<u64>>,
}

impl std::fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateStore")
            .field("name", &self.name)
            .field("dump_path", &self.dump_path)
            .field("keys", &self.data.lock().len())
            .finish()
    }
}

impl MemoryStateStore {
    /// Creates an empty store that persists to `dump_path`.
    pub fn new(name: impl Into<String>, dump_path: impl Into<PathBuf>) -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            name: name.into(),
            dump_path: dump_path.into(),
            data: Arc::new(Mutex::new(BTreeMap::new())),
            changes: Arc::new(tx),
        }
    }

    /// Sets one field synchronously (test and fixture helper).
    pub fn insert(&self, key: &str, field: &str, value: &str) {
        self.data
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        self.bump();
    }

    /// Returns a copy of one hash.
    pub fn get(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.data.lock().get(key).cloned()
    }

    /// Returns a copy of everything.
    pub fn entries(&self) -> Entries {
        self.data.lock().clone()
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .data
            .lock()
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .data
            .lock()
            .get(key)
            .map(|hash| hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        {
            let mut data = self.data.lock();
            let entry = data.entry(key.to_string()).or_default();
            for (field, value) in fields {
                entry.insert(field.clone(), value.clone());
            }
        }
        self.bump();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.data.lock().keys().cloned().collect())
    }

    async fn del(&self, keys: &[String]) -> Result<usize, StoreError> {
        let removed = {
            let mut data = self.data.lock();
            keys.iter().filter(|k| data.remove(*k).is_some()).count()
        };
        if removed > 0 {
            self.bump();
        }
        Ok(removed)
    }

    async fn persist(&self) -> Result<PathBuf, StoreError> {
        let dump = StoreDump::new(self.name.clone(), self.entries());
        dump.write_to(&self.dump_path)?;
        tracing::debug!(
            db = %self.name,
            path = %self.dump_path.display(),
            keys = dump.entries.len(),
            "Persisted store contents"
        );
        Ok(self.dump_path.clone())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.data.lock().clear();
        self.bump();
        Ok(())
    }

    fn watch(&self) -> Option<watch::Receiver<u64>> {
        Some(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStateStore::new("STATE_DB", "/nonexistent/dump.json");
        store
            .hset("WARM_RESTART_TABLE|syncd", &fields(&[("state", "requesting")]))
            .await
            .unwrap();

        assert_eq!(
            store
                .hget("WARM_RESTART_TABLE|syncd", "state")
                .await
                .unwrap()
                .as_deref(),
            Some("requesting")
        );
        assert!(store.hget("missing", "state").await.unwrap().is_none());
        assert!(store.hgetall("missing").await.unwrap().is_empty());

        let removed = store
            .del(&["WARM_RESTART_TABLE|syncd".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_persist_writes_versioned_dump() {
        let temp_dir = TempDir::new().unwrap();
        let dump_path = temp_dir.path().join("redis").join("asic_db.json");
        let store = MemoryStateStore::new("ASIC_DB", &dump_path);
        store.insert("ASIC_STATE:SAI_OBJECT_TYPE_SWITCH:oid:0x21", "k", "v");

        let path = store.persist().await.unwrap();
        assert_eq!(path, dump_path);

        let dump = StoreDump::read_from(&path).unwrap();
        assert_eq!(dump.version, DUMP_FORMAT_VERSION);
        assert_eq!(dump.db, "ASIC_DB");
        assert_eq!(dump.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_notifies_on_write() {
        let store = MemoryStateStore::new("STATE_DB", "/nonexistent/dump.json");
        let mut rx = store.watch().unwrap();
        let before = *rx.borrow_and_update();

        store.insert("FAST_REBOOT|system", "enable", "true");
        rx.changed().await.unwrap();
        assert_ne!(*rx.borrow(), before);
    }

    #[tokio::test]
    async fn test_flush_clears_everything() {
        let store = MemoryStateStore::new("ASIC_DB", "/nonexistent/dump.json");
        store.insert("a", "f", "v");
        store.insert("b", "f", "v");
        store.flush().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[test]
    fn test_read_corrupted_dump() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dump.json");
        fs::write(&path, "this is not valid json").unwrap();
        assert!(matches!(
            StoreDump::read_from(&path),
            Err(StoreError::Serialization { .. })
        ));
    }
}
