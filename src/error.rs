//! Unified error taxonomy returned by [`crate::store::TaskStore`].
//!
//! Sub-components (atomic storage, integrity, audit, checkpoints, sessions)
//! each carry their own narrow error enum; this type wraps them behind the
//! ten-kind taxonomy the store presents to callers, each variant carrying
//! its source error via `#[from]`.

use miette::Diagnostic;
use thiserror::Error;

use crate::atomic_store::AtomicStoreError;
use crate::audit::AuditError;
use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::session::SessionError;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    #[diagnostic(code(taskvault::validation))]
    ValidationError(String),

    #[error("integrity check failed: {0}")]
    #[diagnostic(code(taskvault::integrity))]
    IntegrityError(String),

    #[error("task not found: {0}")]
    #[diagnostic(code(taskvault::not_found))]
    NotFound(String),

    #[error("version conflict on {id}: expected {expected}, found {found}")]
    #[diagnostic(
        code(taskvault::version_conflict),
        help("reload the task and reapply your change")
    )]
    VersionConflict {
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("lock acquisition timed out: {0}")]
    #[diagnostic(code(taskvault::lock_timeout))]
    LockTimeout(String),

    #[error("failed to persist state: {0}")]
    #[diagnostic(code(taskvault::persist))]
    PersistError(String),

    #[error("rollback failed, store state may be inconsistent: {0}")]
    #[diagnostic(
        code(taskvault::rollback_failed),
        severity(Error),
        help("restore the last known-good checkpoint before continuing")
    )]
    RollbackFailed(String),

    #[error("corruption detected: {0}")]
    #[diagnostic(code(taskvault::corruption_detected))]
    CorruptionDetected(String),

    #[error("configuration error: {0}")]
    #[diagnostic(code(taskvault::config))]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    #[diagnostic(code(taskvault::serde))]
    Serde(#[from] serde_json::Error),
}

impl From<AtomicStoreError> for StoreError {
    fn from(e: AtomicStoreError) -> Self {
        match e {
            AtomicStoreError::LockTimeout { .. } => StoreError::LockTimeout(e.to_string()),
            AtomicStoreError::RollbackFailed { .. } => StoreError::RollbackFailed(e.to_string()),
            AtomicStoreError::InvalidContent { .. } => StoreError::CorruptionDetected(e.to_string()),
            AtomicStoreError::Io { .. } => StoreError::PersistError(e.to_string()),
            AtomicStoreError::Serde(inner) => StoreError::Serde(inner),
        }
    }
}

impl From<CheckpointError> for StoreError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::NotFound { id } => StoreError::NotFound(format!("checkpoint {id}")),
            CheckpointError::IntegrityMismatch { .. } => {
                StoreError::CorruptionDetected(e.to_string())
            }
            CheckpointError::Backend(inner) => inner.into(),
            CheckpointError::Serde(inner) => StoreError::Serde(inner),
        }
    }
}

impl From<SessionError> for StoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound { session_id } => {
                StoreError::NotFound(format!("session {session_id}"))
            }
            SessionError::Backend(inner) => inner.into(),
            SessionError::Serde(inner) => StoreError::Serde(inner),
        }
    }
}

impl From<AuditError> for StoreError {
    fn from(e: AuditError) -> Self {
        match &e {
            AuditError::ChainBroken { .. } => StoreError::CorruptionDetected(e.to_string()),
            AuditError::Io(_) => StoreError::PersistError(e.to_string()),
            AuditError::Serde(_) => StoreError::PersistError(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
