//! Redis-backed [`StateStore`] for STATE_DB and ASIC_DB.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::state_db::{Entries, StateStore, StoreDump};

/// State store backed by one Redis logical database.
pub struct RedisStateStore {
    db_name: String,
    host: String,
    port: u16,
    db_number: u32,
    dump_path: PathBuf,
    connection: Mutex<Option<ConnectionManager>>,
}

impl std::fmt::Debug for RedisStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStateStore")
            .field("db_name", &self.db_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_number", &self.db_number)
            .finish()
    }
}

impl RedisStateStore {
    /// Creates an unconnected store.
    pub fn new(
        db_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        db_number: u32,
        dump_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db_name: db_name.into(),
            host: host.into(),
            port,
            db_number,
            dump_path: dump_path.into(),
            connection: Mutex::new(None),
        }
    }

    /// STATE_DB store; STATE_DB is never persisted, so the dump path is unused.
    pub fn state_db(config: &DatabaseConfig) -> Self {
        Self::new(
            "STATE_DB",
            config.redis_host.clone(),
            config.redis_port,
            config.state_db_number,
            "/var/lib/redis/state_db.json",
        )
    }

    /// ASIC_DB store persisting to `dump_path`.
    pub fn asic_db(config: &DatabaseConfig, dump_path: impl Into<PathBuf>) -> Self {
        Self::new(
            "ASIC_DB",
            config.redis_host.clone(),
            config.redis_port,
            config.asic_db_number,
            dump_path,
        )
    }

    /// Opens the connection.
    pub async fn connect(&self) -> Result<(), StoreError> {
        let url = format!("redis://{}:{}/{}", self.host, self.port, self.db_number);
        let client = redis::Client::open(url.as_str()).map_err(|e| {
            StoreError::connection(&self.db_name, format!("Failed to create client: {}", e))
        })?;
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::connection(&self.db_name, format!("Failed to connect: {}", e))
        })?;

        *self.connection.lock().await = Some(manager);
        tracing::info!(db = %self.db_name, host = %self.host, port = self.port, "Connected to Redis");
        Ok(())
    }

    async fn conn(&self) -> Result<ConnectionManager, StoreError> {
        self.connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| StoreError::connection(&self.db_name, "Not connected to Redis"))
    }

    fn command_err(&self, operation: &str, e: redis::RedisError) -> StoreError {
        StoreError::command(&self.db_name, operation, e.to_string())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    fn name(&self) -> &str {
        &self.db_name
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.hget(key, field)
            .await
            .map_err(|e| self.command_err("hget", e))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.hgetall(key)
            .await
            .map_err(|e| self.command_err("hgetall", e))
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset_multiple(key, fields)
            .await
            .map_err(|e| self.command_err("hset", e))?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.keys("*")
            .await
            .map_err(|e| self.command_err("keys", e))
    }

    async fn del(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        conn.del(keys)
            .await
            .map_err(|e| self.command_err("del", e))
    }

    async fn persist(&self) -> Result<PathBuf, StoreError> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn
            .keys("*")
            .await
            .map_err(|e| self.command_err("keys", e))?;

        let mut typed = Vec::with_capacity(keys.len());
        for key in keys {
            let kind: String = redis::cmd("TYPE")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.command_err("type", e))?;
            typed.push((key, kind));
        }
        let keys = hash_keys(&self.db_name, typed)?;

        let mut entries: Entries = BTreeMap::new();
        for key in keys {
            let hash: BTreeMap<String, String> = conn
                .hgetall(&key)
                .await
                .map_err(|e| self.command_err("hgetall", e))?;
            entries.insert(key, hash);
        }

        let dump = StoreDump::new(self.db_name.clone(), entries);
        dump.write_to(&self.dump_path)?;
        tracing::info!(
            db = %self.db_name,
            path = %self.dump_path.display(),
            keys = dump.entries.len(),
            "Persisted store contents"
        );
        Ok(self.dump_path.clone())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_err("flushdb", e))?;
        Ok(())
    }
}

/// Returns the keys of `typed` (key, TYPE reply) pairs, failing if any value
/// is not a hash. A key that vanished since KEYS (`none`) is dropped.
fn hash_keys(db: &str, typed: Vec<(String, String)>) -> Result<Vec<String>, StoreError> {
    let mut keys = Vec::with_capacity(typed.len());
    let mut unsupported = Vec::new();
    for (key, kind) in typed {
        match kind.as_str() {
            "hash" => keys.push(key),
            "none" => {}
            _ => {
                tracing::error!(db = %db, key = %key, kind = %kind, "Non-hash key in dump");
                unsupported.push(format!("{} ({})", key, kind));
            }
        }
    }
    if unsupported.is_empty() {
        Ok(keys)
    } else {
        Err(StoreError::UnsupportedType {
            db: db.to_string(),
            keys: unsupported,
        })
    }
}
