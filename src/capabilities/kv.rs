use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        let invalid = |reason: &str| KvError::InvalidKey {
            key: key.chars().take(50).collect(),
            reason: reason.to_string(),
        };

        if key.trim().is_empty() {
            return Err(invalid("key cannot be empty"));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(invalid("key exceeds maximum length"));
        }
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(invalid("key cannot contain path traversal sequences"));
        }
        if key.chars().any(char::is_control) {
            return Err(invalid("key contains control characters"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Queue,
    Meta,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyNamespace::Queue => "queue:",
            KeyNamespace::Meta => "meta:",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?})")]
    Storage {
        code: StorageErrorCode,
        message: String,
    },
}

impl KvError {
    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { code, .. } => code.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

// ============================================================================
// Backend contract
// ============================================================================

/// Durable key-value backend under the offline queue. The medium is the
/// backend's concern; the queue only needs point reads/writes and a prefix
/// scan to rebuild itself on start.
pub trait QueueStorage: Send {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    fn set(&mut self, key: &KvKey, value: &[u8]) -> Result<(), KvError>;
    /// Returns whether the key existed.
    fn remove(&mut self, key: &KvKey) -> Result<bool, KvError>;
    /// All entries in a namespace, ordered by key.
    fn scan(&self, namespace: KeyNamespace) -> Result<Vec<(String, Vec<u8>)>, KvError>;
}

fn check_value(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Process-lifetime storage; what the kiosk uses when no disk is configured.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_entries(entries: BTreeMap<String, Vec<u8>>) -> Self {
        Self { entries }
    }

    pub(crate) fn entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl QueueStorage for MemoryStorage {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.get(&key.raw()).cloned())
    }

    fn set(&mut self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_value(value)?;
        self.entries.insert(key.raw(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.entries.remove(&key.raw()).is_some())
    }

    fn scan(&self, namespace: KeyNamespace) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let prefix = namespace.prefix();
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect())
    }
}

// ============================================================================
// SQLite
// ============================================================================

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStorage;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;

    fn map_err(e: rusqlite::Error) -> KvError {
        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                rusqlite::ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                rusqlite::ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                rusqlite::ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }

    /// Single-table SQLite backend. Every `set` is its own transaction, so a
    /// record is durable as soon as the call returns.
    pub struct SqliteStorage {
        conn: Connection,
    }

    impl std::fmt::Debug for SqliteStorage {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SqliteStorage")
                .field("path", &self.conn.path())
                .finish()
        }
    }

    impl SqliteStorage {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(map_err)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
                .map_err(map_err)?;
            conn.pragma_update(None, "synchronous", "FULL").map_err(map_err)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            Self::init(Connection::open_in_memory().map_err(map_err)?)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
                );
                "#,
            )
            .map_err(map_err)?;
            Ok(Self { conn })
        }
    }

    impl QueueStorage for SqliteStorage {
        fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            self.conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key.raw()], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(map_err)
        }

        fn set(&mut self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
            check_value(value)?;
            self.conn
                .execute(
                    r#"
                    INSERT INTO kv (key, value) VALUES (?1, ?2)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = strftime('%s', 'now')
                    "#,
                    params![key.raw(), value],
                )
                .map_err(map_err)?;
            Ok(())
        }

        fn remove(&mut self, key: &KvKey) -> Result<bool, KvError> {
            let n = self
                .conn
                .execute("DELETE FROM kv WHERE key = ?1", params![key.raw()])
                .map_err(map_err)?;
            Ok(n > 0)
        }

        fn scan(&self, namespace: KeyNamespace) -> Result<Vec<(String, Vec<u8>)>, KvError> {
            let prefix = namespace.prefix();
            let mut stmt = self
                .conn
                .prepare("SELECT key, value FROM kv WHERE substr(key, 1, ?1) = ?2 ORDER BY key")
                .map_err(map_err)?;
            let rows = stmt
                .query_map(params![prefix.len() as i64, prefix], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .map_err(map_err)?;

            let mut out = Vec::new();
            for row in rows {
                let (key, value) = row.map_err(map_err)?;
                out.push((key[prefix.len()..].to_string(), value));
            }
            Ok(out)
        }
    }
}
