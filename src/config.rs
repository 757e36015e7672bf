//! Configuration for vitals-sync

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dedup::OutboxPolicy;
use crate::error::SyncError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vitals-sync")
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Database file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
        }
    }
}

fn default_database_file() -> String {
    "vitals.db".to_string()
}

/// Outbox delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Events taken per drain pass
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Delivery attempts before an event is failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Periodic drain interval in seconds
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Retry delay ceiling
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Per-push timeout in milliseconds
    #[serde(default = "default_push_timeout")]
    pub push_timeout_ms: u64,

    /// Age after which synced and failed events are pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_created_priority")]
    pub created_priority: i32,

    #[serde(default = "default_updated_priority")]
    pub updated_priority: i32,
}

fn default_batch_size() -> u32 { 25 }
fn default_max_attempts() -> u32 { 5 }
fn default_drain_interval() -> u64 { 30 }
fn default_backoff_base() -> u64 { 5 }
fn default_backoff_max() -> u64 { 900 }
fn default_push_timeout() -> u64 { 15_000 }
fn default_retention_days() -> u32 { 30 }
fn default_created_priority() -> i32 { 10 }
fn default_updated_priority() -> i32 { 5 }

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            drain_interval_secs: default_drain_interval(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            push_timeout_ms: default_push_timeout(),
            retention_days: default_retention_days(),
            created_priority: default_created_priority(),
            updated_priority: default_updated_priority(),
        }
    }
}

impl OutboxConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs.max(1))
    }

    /// Priorities and attempt budget applied to newly queued events
    pub fn policy(&self) -> OutboxPolicy {
        OutboxPolicy {
            created_priority: self.created_priority,
            updated_priority: self.updated_priority,
            max_attempts: self.max_attempts,
        }
    }
}

/// Ingest settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Per-date fetch timeout in milliseconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    /// Dates remembered per metric in the sync window
    #[serde(default = "default_window_retention")]
    pub window_retention: usize,

    /// Quiet period before a source change triggers a sync
    #[serde(default = "default_debounce_ms")]
    pub trigger_debounce_ms: u64,

    /// Days before today re-synced on a source change
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Quiet period before change subscribers refresh
    #[serde(default = "default_debounce_ms")]
    pub notify_debounce_ms: u64,
}

fn default_fetch_timeout() -> u64 { 20_000 }
fn default_window_retention() -> usize { crate::sync_window::DEFAULT_WINDOW_RETENTION }
fn default_debounce_ms() -> u64 { crate::debounce::DEFAULT_DEBOUNCE.as_millis() as u64 }
fn default_lookback_days() -> u32 { 1 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout(),
            window_retention: default_window_retention(),
            trigger_debounce_ms: default_debounce_ms(),
            lookback_days: default_lookback_days(),
            notify_debounce_ms: default_debounce_ms(),
        }
    }
}

impl SyncConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn trigger_debounce(&self) -> Duration {
        Duration::from_millis(self.trigger_debounce_ms)
    }

    pub fn notify_debounce(&self) -> Duration {
        Duration::from_millis(self.notify_debounce_ms)
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SyncError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.outbox.batch_size == 0 {
            return Err(SyncError::Config("outbox.batch_size must be at least 1".into()));
        }
        if self.outbox.max_attempts == 0 {
            return Err(SyncError::Config("outbox.max_attempts must be at least 1".into()));
        }
        if self.outbox.backoff_max_secs < self.outbox.backoff_base_secs {
            return Err(SyncError::Config(
                "outbox.backoff_max_secs must not be below backoff_base_secs".into(),
            ));
        }
        if self.storage.database_file.is_empty() {
            return Err(SyncError::Config("storage.database_file must not be empty".into()));
        }
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage.storage_dir.join(&self.storage.database_file)
    }
}
