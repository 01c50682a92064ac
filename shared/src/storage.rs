//! Durable key-value storage behind the `KeyValue` effect.
//!
//! Keys are strings and values are opaque bytes, as `crux_kv` sends them.
//! The shell owns one store and applies operations in the order the core
//! emitted them.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use crux_kv::error::KeyValueError;
use crux_kv::{KeyValueOperation, KeyValueResponse, KeyValueResult};
use tracing::{debug, warn};

use crate::capabilities::KvError;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Returns whatever was stored under `key` before.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, KvError>;

    /// Returns whatever was stored under `key` before.
    async fn delete(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Execute one operation and build the result the core expects back.
    /// Listings are never paged, so any cursor other than 0 is unknown.
    async fn apply(&self, op: &KeyValueOperation) -> KeyValueResult {
        let response = match op {
            KeyValueOperation::Get { key } => self
                .get(key)
                .await
                .map(|value| KeyValueResponse::Get { value: value.into() }),
            KeyValueOperation::Set { key, value } => self
                .set(key, value.clone())
                .await
                .map(|previous| KeyValueResponse::Set {
                    previous: previous.into(),
                }),
            KeyValueOperation::Delete { key } => self
                .delete(key)
                .await
                .map(|previous| KeyValueResponse::Delete {
                    previous: previous.into(),
                }),
            KeyValueOperation::Exists { key } => self
                .exists(key)
                .await
                .map(|is_present| KeyValueResponse::Exists { is_present }),
            KeyValueOperation::ListKeys { cursor, .. } if *cursor != 0 => {
                return KeyValueResult::Err {
                    error: KeyValueError::CursorNotFound,
                };
            }
            KeyValueOperation::ListKeys { prefix, .. } => {
                self.list_keys(prefix)
                    .await
                    .map(|keys| KeyValueResponse::ListKeys {
                        keys,
                        next_cursor: 0,
                    })
            }
        };

        match response {
            Ok(response) => KeyValueResult::Ok { response },
            Err(e) => {
                warn!(error = %e, "storage operation failed");
                KeyValueResult::Err {
                    error: KeyValueError::from(&e),
                }
            }
        }
    }
}

fn poisoned(_: impl std::fmt::Display) -> KvError {
    KvError::Unavailable {
        message: "store lock poisoned".into(),
    }
}

/// In-process store for hosts without a filesystem, and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.lock().map_err(poisoned)?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .entries
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), value))
    }

    async fn delete(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.lock().map_err(poisoned)?.remove(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .entries
            .lock()
            .map_err(poisoned)?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{async_trait, debug, poisoned, DurableStore, KvError, Mutex};
    use rusqlite::{params, Connection, OptionalExtension};
    use std::sync::Arc;

    const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );";

    fn backend(key: &str) -> impl Fn(rusqlite::Error) -> KvError + '_ {
        move |e| KvError::Backend {
            key: key.to_string(),
            message: e.to_string(),
        }
    }

    fn read(conn: &Connection, key: &str) -> rusqlite::Result<Option<Vec<u8>>> {
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
    }

    /// File-backed store that survives restarts. Queries run on the blocking
    /// pool, one at a time.
    #[derive(Clone)]
    pub struct SqliteStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl std::fmt::Debug for SqliteStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SqliteStore").finish_non_exhaustive()
        }
    }

    impl SqliteStore {
        pub fn open(path: &str) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(|e| KvError::Unavailable {
                message: e.to_string(),
            })?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(|e| KvError::Unavailable {
                message: e.to_string(),
            })?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(SCHEMA).map_err(|e| KvError::Unavailable {
                message: e.to_string(),
            })?;
            debug!("kv store ready");
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn run<T, F>(&self, key: &str, query: F) -> Result<T, KvError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            let key = key.to_string();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().map_err(poisoned)?;
                query(&conn).map_err(backend(&key))
            })
            .await
            .map_err(|e| KvError::Unavailable {
                message: e.to_string(),
            })?
        }
    }

    #[async_trait]
    impl DurableStore for SqliteStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            let owned = key.to_string();
            self.run(key, move |conn| read(conn, &owned)).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, KvError> {
            let owned = key.to_string();
            self.run(key, move |conn| {
                let previous = read(conn, &owned)?;
                conn.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![owned, value],
                )?;
                Ok(previous)
            })
            .await
        }

        async fn delete(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            let owned = key.to_string();
            self.run(key, move |conn| {
                let previous = read(conn, &owned)?;
                conn.execute("DELETE FROM kv WHERE key = ?1", params![owned])?;
                Ok(previous)
            })
            .await
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
            let prefix = prefix.to_string();
            self.run("*", move |conn| {
                let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
                let keys = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut matching = Vec::new();
                for key in keys {
                    let key = key?;
                    if key.starts_with(&prefix) {
                        matching.push(key);
                    }
                }
                Ok(matching)
            })
            .await
        }
    }
}
