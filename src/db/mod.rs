mod memory;

pub use memory::MemoryStore;

use crate::config::CoreConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{AppStateSnapshot, NoteSettings};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub mod keys {
    pub const APP_STATE: &str = "appState";
    pub const SETTINGS: &str = "settings";
    pub const IMPORT_STAGING: &str = "importStaging";
    pub const SESSION_POINTER: &str = "sessionPointer";
    pub const LEASE: &str = "noteLease";
    pub const HEARTBEAT_PREFIX: &str = "heartbeat:";
    pub const PATCH_PREFIX: &str = "patch:";
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AppResult<()>;
    fn remove(&self, key: &str) -> AppResult<()>;
    fn keys_with_prefix(&self, prefix: &str) -> AppResult<Vec<String>>;
    /// Writes `value` only if the slot currently holds `expected` (`None` = absent).
    fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: &str) -> AppResult<bool>;
}

pub trait KvStoreExt: KvStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|error| AppError::Storage(format!("corrupt value at {}: {}", key, error))),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> AppResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

impl KvStore for Database {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT value_json FROM kv WHERE key = ?1", [key], |row| {
            row.get::<_, String>(0)
        })
        .optional()
        .map_err(AppError::from)
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> AppResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
        )?;
        let keys = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: &str) -> AppResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row("SELECT value_json FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO kv (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

#[derive(Clone)]
pub struct StoreSet {
    pub durable: Arc<dyn KvStore>,
    pub local: Arc<dyn KvStore>,
    pub session: Arc<dyn KvStore>,
}

impl StoreSet {
    pub fn open(data_dir: &Path, config: &CoreConfig) -> AppResult<Self> {
        let durable: Arc<dyn KvStore> = Arc::new(Database::new(&data_dir.join("notes.sqlite"))?);
        let local: Arc<dyn KvStore> = Arc::new(Database::new(&data_dir.join("local.sqlite"))?);
        let session_path = config
            .session_store_path
            .clone()
            .unwrap_or_else(|| data_dir.join("session.sqlite"));
        let session: Arc<dyn KvStore> = Arc::new(Database::new(&session_path)?);
        Ok(Self {
            durable,
            local,
            session,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            durable: Arc::new(MemoryStore::new()),
            local: Arc::new(MemoryStore::new()),
            session: Arc::new(MemoryStore::new()),
        }
    }
}

pub fn read_app_state(store: &dyn KvStore) -> AppResult<AppStateSnapshot> {
    Ok(store
        .get_json::<AppStateSnapshot>(keys::APP_STATE)?
        .unwrap_or_default())
}

pub fn write_app_state(store: &dyn KvStore, snapshot: &AppStateSnapshot) -> AppResult<()> {
    store.set_json(keys::APP_STATE, snapshot)
}

pub fn read_settings(store: &dyn KvStore) -> AppResult<NoteSettings> {
    match store.get(keys::SETTINGS)? {
        Some(raw) => Ok(serde_json::from_str::<NoteSettings>(&raw).unwrap_or_default()),
        None => Ok(NoteSettings::default()),
    }
}

pub fn write_settings(store: &dyn KvStore, settings: &NoteSettings) -> AppResult<()> {
    store.set_json(keys::SETTINGS, settings)
}

pub fn update_settings(store: &dyn KvStore, update: serde_json::Value) -> AppResult<NoteSettings> {
    let current = read_settings(store)?;
    let mut merged = serde_json::to_value(current)?;
    merge_json(&mut merged, update);
    let settings: NoteSettings = serde_json::from_value(merged)
        .map_err(|error| AppError::Validation(format!("invalid settings update: {}", error)))?;
    write_settings(store, &settings)?;
    Ok(settings)
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
