//! Crate-wide configuration, loadable from a file or built programmatically.
//!
//! One `StoreConfig` holds every tunable named across the component
//! contracts (`AtomicStore`'s lock timeout, `CheckpointManager`'s
//! triggers, `CacheLayer`'s bounds, and so on) rather than scattering
//! separate config structs per component.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether task state lives in one primary document or one file per task.
///
/// See `DESIGN.md` for why `PerTask` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageLayout {
    /// A single `primary_file_name` document holding every task.
    SingleFile,
    /// One `task-<id>.json` file per task.
    #[default]
    PerTask,
}

/// Audit verbosity: how much detail is recorded per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Basic,
    #[default]
    Detailed,
    Comprehensive,
}

/// Strictness applied by [`crate::integrity::IntegrityEngine`] validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Lenient,
    #[default]
    Standard,
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub persistence_directory: PathBuf,
    pub storage_layout: StorageLayout,
    pub primary_file_name: String,

    pub heartbeat_interval_ms: u64,
    pub checkpoint_interval_ms: u64,
    pub max_checkpoints: usize,
    pub checkpoint_operation_threshold: u64,
    pub crash_recovery_enabled: bool,
    pub session_timeout_ms: u64,

    pub compression_enabled: bool,
    pub encryption_enabled: bool,

    pub cache_size: usize,
    pub cache_ttl_ms: u64,
    pub cache_sweep_interval_ms: u64,

    pub batch_size: usize,
    pub async_writes: bool,

    pub audit_level: AuditLevel,
    pub auto_repair: bool,
    pub validation_level: ValidationLevel,

    pub lock_timeout_ms: u64,
    pub lock_stale_threshold_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persistence_directory: PathBuf::from(".taskvault"),
            storage_layout: StorageLayout::PerTask,
            primary_file_name: "FEATURES.json".to_string(),

            heartbeat_interval_ms: 30_000,
            checkpoint_interval_ms: 5 * 60 * 1000,
            max_checkpoints: 10,
            checkpoint_operation_threshold: 1000,
            crash_recovery_enabled: true,
            session_timeout_ms: 10 * 60 * 1000,

            compression_enabled: false,
            encryption_enabled: false,

            cache_size: 1024,
            cache_ttl_ms: 5 * 60 * 1000,
            cache_sweep_interval_ms: 60 * 1000,

            batch_size: 100,
            async_writes: true,

            audit_level: AuditLevel::Detailed,
            auto_repair: true,
            validation_level: ValidationLevel::Standard,

            lock_timeout_ms: 30_000,
            lock_stale_threshold_ms: 5 * 60 * 1000,
        }
    }
}

impl StoreConfig {
    /// Load configuration from a JSON file, falling back to defaults for
    /// any field the file omits.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not parse as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    #[must_use]
    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub fn lock_stale_threshold(&self) -> Duration {
        Duration::from_millis(self.lock_stale_threshold_ms)
    }

    #[must_use]
    pub fn primary_file_path(&self) -> PathBuf {
        self.persistence_directory.join(&self.primary_file_name)
    }

    #[must_use]
    pub fn task_file_path(&self, id: &str) -> PathBuf {
        self.persistence_directory.join(format!("task-{id}.json"))
    }

    #[must_use]
    pub fn session_file_path(&self, id: &str) -> PathBuf {
        self.persistence_directory.join(format!("session-{id}.json"))
    }

    #[must_use]
    pub fn checkpoint_file_path(&self, id: &str) -> PathBuf {
        self.persistence_directory
            .join(format!("checkpoint-{id}.json"))
    }

    #[must_use]
    pub fn audit_log_path(&self) -> PathBuf {
        self.persistence_directory.join("audit-log.jsonl")
    }

    #[must_use]
    pub fn audit_chainstate_path(&self) -> PathBuf {
        self.persistence_directory.join("audit-log.chainstate")
    }

    #[must_use]
    pub fn transactions_log_path(&self) -> PathBuf {
        self.persistence_directory.join("transactions.log")
    }

    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.persistence_directory.join("backups")
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.checkpoint_interval_ms, 300_000);
        assert_eq!(cfg.max_checkpoints, 10);
        assert_eq!(cfg.checkpoint_operation_threshold, 1000);
        assert_eq!(cfg.session_timeout_ms, 600_000);
        assert!(cfg.crash_recovery_enabled);
        assert!(cfg.auto_repair);
    }

    #[test]
    fn layout_defaults_to_per_task() {
        assert_eq!(StoreConfig::default().storage_layout, StorageLayout::PerTask);
    }
}
