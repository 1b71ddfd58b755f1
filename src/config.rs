use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::capabilities::{KvError, MemoryStorage, QueueStorage};
use crate::offline_store::{FileStorage, StoreError};
use crate::outbox::MAX_QUEUE_RECORDS;
use crate::workflow::payment::PaymentMethod;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("queue storage unavailable: {0}")]
    Storage(String),
}

impl From<KvError> for ConfigError {
    fn from(e: KvError) -> Self {
        ConfigError::Storage(e.to_string())
    }
}

impl From<StoreError> for ConfigError {
    fn from(e: StoreError) -> Self {
        ConfigError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub payment: PaymentConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: crate::IDLE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub expected_otp: String,
    pub scan_tick_ms: u64,
    pub scan_step_pct: u8,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            expected_otp: "482916".into(),
            scan_tick_ms: 150,
            scan_step_pct: 10,
        }
    }
}

/// Simulated settlement time per method, in ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub upi: u64,
    pub card: u64,
    pub cash: u64,
    pub net_banking: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            upi: 2_000,
            card: 3_000,
            cash: 4_500,
            net_banking: 2_500,
        }
    }
}

impl PaymentConfig {
    #[must_use]
    pub fn settlement_delay(&self, method: PaymentMethod) -> Duration {
        Duration::from_millis(match method {
            PaymentMethod::Upi => self.upi,
            PaymentMethod::Card => self.card,
            PaymentMethod::Cash => self.cash,
            PaymentMethod::NetBanking => self.net_banking,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub tick_ms: u64,
    pub step_pct: u8,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_ms: 250,
            step_pct: 10,
            max_attempts: crate::MAX_RETRY_ATTEMPTS,
            base_backoff_ms: crate::BASE_RETRY_DELAY_MS,
            max_backoff_ms: crate::MAX_RETRY_DELAY_MS,
            jitter_max_ms: crate::JITTER_MAX_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: Option<PathBuf>,
    /// Most undelivered records the queue holds before refusing new ones.
    pub capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: None,
            capacity: MAX_QUEUE_RECORDS,
        }
    }
}

impl StorageConfig {
    pub fn open(&self) -> Result<Box<dyn QueueStorage>, ConfigError> {
        let path = || {
            self.path.as_deref().ok_or(ConfigError::Invalid {
                field: "storage.path",
                reason: "required for the sqlite and file backends",
            })
        };
        let storage: Box<dyn QueueStorage> = match self.backend {
            StorageBackend::Memory => Box::new(MemoryStorage::new()),
            StorageBackend::File => Box::new(FileStorage::open(path()?)?),
            #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
            StorageBackend::Sqlite => Box::new(crate::capabilities::SqliteStorage::open(path()?)?),
            #[cfg(not(all(feature = "sqlite", not(target_arch = "wasm32"))))]
            StorageBackend::Sqlite => {
                return Err(ConfigError::Storage(
                    "built without the sqlite feature".into(),
                ))
            }
        };
        info!(backend = ?self.backend, path = ?self.path, "queue storage opened");
        Ok(storage)
    }
}

impl KioskConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });

        if self.session.idle_timeout_secs == 0 {
            return invalid("session.idle_timeout_secs", "must be greater than 0");
        }
        let otp = &self.auth.expected_otp;
        if otp.len() != 6 || !otp.bytes().all(|b| b.is_ascii_digit()) {
            return invalid("auth.expected_otp", "must be exactly 6 digits");
        }
        if self.auth.scan_tick_ms == 0 {
            return invalid("auth.scan_tick_ms", "must be greater than 0");
        }
        if self.auth.scan_step_pct == 0 || self.auth.scan_step_pct > 100 {
            return invalid("auth.scan_step_pct", "must be between 1 and 100");
        }
        if self.sync.tick_ms == 0 {
            return invalid("sync.tick_ms", "must be greater than 0");
        }
        if self.sync.step_pct == 0 || self.sync.step_pct > 100 {
            return invalid("sync.step_pct", "must be between 1 and 100");
        }
        if self.sync.base_backoff_ms == 0 {
            return invalid("sync.base_backoff_ms", "must be greater than 0");
        }
        if self.sync.max_backoff_ms < self.sync.base_backoff_ms {
            return invalid("sync.max_backoff_ms", "must not be below base_backoff_ms");
        }
        if self.storage.capacity == 0 {
            return invalid("storage.capacity", "must be greater than 0");
        }
        Ok(())
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = KioskConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.auth.expected_otp, "482916");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = KioskConfig::from_toml(
            r#"
            [session]
            idle_timeout_secs = 45

            [payment]
            cash = 100

            [storage]
            backend = "file"
            path = "/var/lib/kiosk/queue.kq"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.idle_timeout_secs, 45);
        assert_eq!(config.payment.settlement_delay(PaymentMethod::Cash), Duration::from_millis(100));
        assert_eq!(config.payment.settlement_delay(PaymentMethod::Upi), Duration::from_millis(2_000));
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.storage.capacity, MAX_QUEUE_RECORDS);
        assert_eq!(config.sync.tick_ms, 250);
    }

    #[test]
    fn bad_values_are_rejected() {
        for text in [
            "[session]\nidle_timeout_secs = 0",
            "[auth]\nexpected_otp = \"12ab56\"",
            "[auth]\nexpected_otp = \"\"",
            "[sync]\nstep_pct = 150",
            "[sync]\nbase_backoff_ms = 5000\nmax_backoff_ms = 10",
            "[storage]\ncapacity = 0",
        ] {
            assert!(
                matches!(KioskConfig::from_toml(text), Err(ConfigError::Invalid { .. })),
                "accepted: {text}"
            );
        }
        assert!(matches!(KioskConfig::from_toml("session = 3"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn file_backend_requires_path() {
        let storage = StorageConfig {
            backend: StorageBackend::File,
            ..StorageConfig::default()
        };
        assert!(matches!(storage.open(), Err(ConfigError::Invalid { field: "storage.path", .. })));
    }

    #[test]
    fn file_backend_opens_in_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            backend: StorageBackend::File,
            path: Some(dir.path().join("queue.kq")),
            ..StorageConfig::default()
        };
        assert!(storage.open().is_ok());
    }
}
