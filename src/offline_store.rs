//! Single-file backend for the offline queue. The whole key space lives in
//! one checksummed envelope that is rewritten atomically on every change,
//! which suits a kiosk with a handful of pending records and no database.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::capabilities::{
    KeyNamespace, KvError, KvKey, MemoryStorage, QueueStorage, StorageErrorCode,
};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 100 * 1024 * 1024;
const MAX_STORE_ENTRIES: usize = 20_000;
const STORE_MAGIC: &[u8; 4] = b"KQST";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many entries: {count}, max {max}")]
    TooManyEntries { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for KvError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::Io(io) => match io.kind() {
                std::io::ErrorKind::PermissionDenied => StorageErrorCode::PermissionDenied,
                std::io::ErrorKind::WouldBlock => StorageErrorCode::Busy,
                _ => StorageErrorCode::IoError,
            },
            StoreError::Corrupted { .. }
            | StoreError::IntegrityCheckFailed { .. }
            | StoreError::FutureSchema { .. }
            | StoreError::UnknownSchema(_)
            | StoreError::Serialization(_) => StorageErrorCode::Corrupted,
            StoreError::StoreTooLarge { .. } | StoreError::TooManyEntries { .. } => {
                StorageErrorCode::DiskFull
            }
        };
        KvError::storage(code, e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct StorePayload {
    entries: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    inner: MemoryStorage,
}

impl FileStorage {
    /// A missing file is an empty store; anything unreadable is an error so
    /// a damaged queue is never silently replaced by an empty one.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            debug!("no store file yet, starting empty");
            return Ok(Self {
                path,
                inner: MemoryStorage::new(),
            });
        }

        let bytes = std::fs::read(&path)?;
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty file",
            });
        }
        let payload = Self::decode(&bytes)?;
        debug!(entries = payload.entries.len(), "store loaded");

        Ok(Self {
            path,
            inner: MemoryStorage::from_entries(payload.entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, StoreError> {
        let payload = StorePayload {
            entries: entries.clone(),
        };
        let mut payload_bytes = Vec::new();
        ciborium::into_writer(&payload, &mut payload_bytes)?;

        let checksum = blake3::hash(&payload_bytes);
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload: payload_bytes,
        };

        let mut envelope_bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut envelope_bytes)?;
        Ok(envelope_bytes)
    }

    fn decode(bytes: &[u8]) -> Result<StorePayload, StoreError> {
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }
        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }
        if envelope.schema_version == 0 {
            return Err(StoreError::UnknownSchema(0));
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        let payload: StorePayload = ciborium::from_reader(&envelope.payload[..])?;
        if payload.entries.len() > MAX_STORE_ENTRIES {
            return Err(StoreError::TooManyEntries {
                count: payload.entries.len(),
                max: MAX_STORE_ENTRIES,
            });
        }
        Ok(payload)
    }

    /// tmp file, fsync, rename, then fsync the directory.
    fn flush(&self) -> Result<(), StoreError> {
        let bytes = Self::encode(self.inner.entries())?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn restore(&mut self, key: &KvKey, previous: Option<Vec<u8>>) -> Result<(), KvError> {
        match previous {
            Some(value) => self.inner.set(key, &value),
            None => self.inner.remove(key).map(|_| ()),
        }
    }
}

impl QueueStorage for FileStorage {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        if self.inner.len() >= MAX_STORE_ENTRIES && self.inner.get(key)?.is_none() {
            return Err(StoreError::TooManyEntries {
                count: self.inner.len() + 1,
                max: MAX_STORE_ENTRIES,
            }
            .into());
        }
        let previous = self.inner.get(key)?;
        self.inner.set(key, value)?;
        if let Err(e) = self.flush() {
            // Memory must not run ahead of disk.
            self.restore(key, previous)?;
            return Err(e.into());
        }
        Ok(())
    }

    fn remove(&mut self, key: &KvKey) -> Result<bool, KvError> {
        let previous = self.inner.get(key)?;
        if previous.is_none() {
            return Ok(false);
        }
        self.inner.remove(key)?;
        if let Err(e) = self.flush() {
            self.restore(key, previous)?;
            return Err(e.into());
        }
        Ok(true)
    }

    fn scan(&self, namespace: KeyNamespace) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        self.inner.scan(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(k: &str) -> KvKey {
        KvKey::new(KeyNamespace::Queue, k).unwrap()
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let store = FileStorage::open(dir.path().join("queue.kq")).unwrap();
        assert!(store.scan(KeyNamespace::Queue).unwrap().is_empty());
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.kq");
        {
            let mut store = FileStorage::open(&path).unwrap();
            store.set(&key("rec-1"), &[1, 2, 3]).unwrap();
            store.set(&key("rec-2"), &[4]).unwrap();
            assert!(store.remove(&key("rec-2")).unwrap());
        }
        let store = FileStorage::open(&path).unwrap();
        assert_eq!(store.get(&key("rec-1")).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.get(&key("rec-2")).unwrap(), None);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn tampered_payload_fails_integrity_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.kq");
        {
            let mut store = FileStorage::open(&path).unwrap();
            store.set(&key("rec-1"), b"payment").unwrap();
        }

        let bytes = std::fs::read(&path).unwrap();
        let mut envelope: StoreEnvelope = ciborium::from_reader(&bytes[..]).unwrap();
        let last = envelope.payload.len() - 1;
        envelope.payload[last] ^= 0xFF;
        let mut tampered = Vec::new();
        ciborium::into_writer(&envelope, &mut tampered).unwrap();
        std::fs::write(&path, tampered).unwrap();

        assert!(matches!(
            FileStorage::open(&path),
            Err(StoreError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn future_schema_is_rejected() {
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            checksum: [0; 32],
            payload: vec![],
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        assert!(matches!(
            FileStorage::decode(&bytes),
            Err(StoreError::FutureSchema { .. })
        ));
    }

    #[test]
    fn wrong_magic_and_empty_file_are_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.kq");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(FileStorage::open(&path), Err(StoreError::Corrupted { .. })));

        let envelope = StoreEnvelope {
            magic: *b"NOPE",
            schema_version: 1,
            checksum: [0; 32],
            payload: vec![],
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        assert!(matches!(
            FileStorage::decode(&bytes),
            Err(StoreError::Corrupted { reason: "invalid magic bytes" })
        ));
    }

    #[test]
    fn failed_flush_rolls_back_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("queue.kq");
        let mut store = FileStorage::open(&path).unwrap();
        assert!(store.set(&key("rec-1"), b"x").is_err());
        assert_eq!(store.get(&key("rec-1")).unwrap(), None);
    }

    #[test]
    fn store_error_maps_to_corrupted_code() {
        let kv: KvError = StoreError::Corrupted { reason: "x" }.into();
        assert!(matches!(
            kv,
            KvError::Storage {
                code: StorageErrorCode::Corrupted,
                ..
            }
        ));
    }
}
