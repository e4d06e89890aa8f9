//! Point-in-time snapshots of the full task map.
//!
//! `Checkpoint`/`CheckpointStore` use a `save`/`load_latest`/`list_checkpoints`
//! trait shape (`list_checkpoints` rather than `list_sessions`, since many
//! checkpoints accumulate per session), with an in-memory backend kept for
//! tests plus a `FileCheckpointStore` that persists through
//! [`crate::atomic_store::AtomicStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::atomic_store::{AtomicStore, ReadOptions};
use crate::checksum;
use crate::ids::{CheckpointId, SessionId, TaskId};
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Automatic,
    Manual,
    CrashRecovery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    pub task_snapshot: HashMap<TaskId, Task>,
    pub integrity_hash: String,
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub checkpoint_type: CheckpointType,
}

impl Checkpoint {
    #[must_use]
    pub fn new(
        session_id: SessionId,
        task_snapshot: HashMap<TaskId, Task>,
        checkpoint_type: CheckpointType,
    ) -> Self {
        let integrity_hash = checksum::digest(&task_snapshot).unwrap_or_default();
        let size_bytes = serde_json::to_vec(&task_snapshot)
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        Self {
            id: CheckpointId::generate(),
            timestamp: Utc::now(),
            session_id,
            task_snapshot,
            integrity_hash,
            size_bytes,
            checkpoint_type,
        }
    }

    #[must_use]
    pub fn integrity_valid(&self) -> bool {
        matches!(checksum::digest(&self.task_snapshot), Ok(h) if h == self.integrity_hash)
    }
}

/// A lightweight summary for `list()`, avoiding a full snapshot load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDescriptor {
    pub id: CheckpointId,
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub checkpoint_type: CheckpointType,
}

impl From<&Checkpoint> for CheckpointDescriptor {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            id: cp.id.clone(),
            timestamp: cp.timestamp,
            session_id: cp.session_id.clone(),
            size_bytes: cp.size_bytes,
            checkpoint_type: cp.checkpoint_type,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint not found: {id}")]
    #[diagnostic(code(taskvault::checkpoint::not_found))]
    NotFound { id: String },

    #[error("checkpoint {id} failed integrity validation")]
    #[diagnostic(code(taskvault::checkpoint::integrity))]
    IntegrityMismatch { id: String },

    #[error("backend error: {0}")]
    #[diagnostic(code(taskvault::checkpoint::backend))]
    Backend(#[from] crate::atomic_store::AtomicStoreError),

    #[error("serialization error: {0}")]
    #[diagnostic(code(taskvault::checkpoint::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;
    async fn load(&self, id: &CheckpointId) -> Result<Option<Checkpoint>>;
    async fn load_latest(&self, session_id: &SessionId) -> Result<Option<Checkpoint>>;
    async fn list_checkpoints(&self) -> Result<Vec<CheckpointDescriptor>>;
    async fn delete(&self, id: &CheckpointId) -> Result<()>;
}

/// Volatile, process-local backend, kept for tests.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<FxHashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        self.inner
            .write()
            .insert(checkpoint.id.to_string(), checkpoint);
        Ok(())
    }

    async fn load(&self, id: &CheckpointId) -> Result<Option<Checkpoint>> {
        Ok(self.inner.read().get(id.as_str()).cloned())
    }

    async fn load_latest(&self, session_id: &SessionId) -> Result<Option<Checkpoint>> {
        Ok(self
            .inner
            .read()
            .values()
            .filter(|c| &c.session_id == session_id)
            .max_by_key(|c| c.timestamp)
            .cloned())
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointDescriptor>> {
        let mut list: Vec<_> = self.inner.read().values().map(CheckpointDescriptor::from).collect();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(list)
    }

    async fn delete(&self, id: &CheckpointId) -> Result<()> {
        self.inner.write().remove(id.as_str());
        Ok(())
    }
}

/// Durable backend that persists each checkpoint as
/// `checkpoint-<id>.json` through [`AtomicStore`]; a directory listing
/// stands in for an index.
pub struct FileCheckpointStore {
    store: AtomicStore,
}

impl FileCheckpointStore {
    #[must_use]
    pub fn new(store: AtomicStore) -> Self {
        Self { store }
    }

    fn file_name(id: &CheckpointId) -> String {
        format!("checkpoint-{id}.json")
    }

    async fn list_files(&self) -> Result<Vec<std::path::PathBuf>> {
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(self.store.root()).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CheckpointError::Backend(
                    crate::atomic_store::AtomicStoreError::Io {
                        path: self.store.root().to_path_buf(),
                        source: e,
                    },
                ));
            }
        };
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| {
            CheckpointError::Backend(crate::atomic_store::AtomicStoreError::Io {
                path: self.store.root().to_path_buf(),
                source: e,
            })
        })? {
            let path = entry.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("checkpoint-") && n.ends_with(".json"));
            if is_checkpoint {
                entries.push(path);
            }
        }
        Ok(entries)
    }

    async fn read_checkpoint(&self, path: &std::path::Path) -> Result<Checkpoint> {
        let bytes = self
            .store
            .atomic_read(path, ReadOptions { require_valid_json: true })
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    #[instrument(skip(self, checkpoint), fields(checkpoint_id = %checkpoint.id))]
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let path = self.store.path_for(&Self::file_name(&checkpoint.id));
        let bytes = serde_json::to_vec(&checkpoint)?;
        self.store.transaction(&path, &bytes).await?;
        Ok(())
    }

    async fn load(&self, id: &CheckpointId) -> Result<Option<Checkpoint>> {
        let path = self.store.path_for(&Self::file_name(id));
        match self.read_checkpoint(&path).await {
            Ok(cp) => Ok(Some(cp)),
            Err(CheckpointError::Backend(crate::atomic_store::AtomicStoreError::Io {
                source,
                ..
            })) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn load_latest(&self, session_id: &SessionId) -> Result<Option<Checkpoint>> {
        let mut latest: Option<Checkpoint> = None;
        for path in self.list_files().await? {
            let cp = self.read_checkpoint(&path).await?;
            if &cp.session_id != session_id {
                continue;
            }
            if latest.as_ref().is_none_or(|l| cp.timestamp > l.timestamp) {
                latest = Some(cp);
            }
        }
        Ok(latest)
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointDescriptor>> {
        let mut out = Vec::new();
        for path in self.list_files().await? {
            out.push(CheckpointDescriptor::from(&self.read_checkpoint(&path).await?));
        }
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    async fn delete(&self, id: &CheckpointId) -> Result<()> {
        let path = self.store.path_for(&Self::file_name(id));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(_) if !path.exists() => Ok(()),
            Err(e) => Err(CheckpointError::Backend(
                crate::atomic_store::AtomicStoreError::Io { path, source: e },
            )),
        }
    }
}

/// Orchestrates checkpoint creation, restore, and retention.
///
/// Retention (`prune`) rebuilds the authoritative list of checkpoints to
/// keep, then removes whatever falls outside it — a compaction pass rather
/// than deleting on the fly as new checkpoints land.
pub struct CheckpointManager {
    backend: Box<dyn CheckpointStore>,
    max_checkpoints: usize,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(backend: Box<dyn CheckpointStore>, max_checkpoints: usize) -> Self {
        Self {
            backend,
            max_checkpoints,
        }
    }

    #[instrument(skip(self, task_snapshot))]
    pub async fn create(
        &self,
        session_id: SessionId,
        task_snapshot: HashMap<TaskId, Task>,
        checkpoint_type: CheckpointType,
    ) -> Result<CheckpointId> {
        let checkpoint = Checkpoint::new(session_id, task_snapshot, checkpoint_type);
        let id = checkpoint.id.clone();
        self.backend.save(checkpoint).await?;
        self.prune().await?;
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn restore(&self, id: &CheckpointId) -> Result<HashMap<TaskId, Task>> {
        let checkpoint = self
            .backend
            .load(id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound { id: id.to_string() })?;
        if !checkpoint.integrity_valid() {
            return Err(CheckpointError::IntegrityMismatch { id: id.to_string() });
        }
        Ok(checkpoint.task_snapshot)
    }

    pub async fn restore_latest_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<(CheckpointId, HashMap<TaskId, Task>)>> {
        let Some(checkpoint) = self.backend.load_latest(session_id).await? else {
            return Ok(None);
        };
        if !checkpoint.integrity_valid() {
            return Err(CheckpointError::IntegrityMismatch {
                id: checkpoint.id.to_string(),
            });
        }
        Ok(Some((checkpoint.id, checkpoint.task_snapshot)))
    }

    /// Keep the most recent `max_checkpoints`, delete the rest.
    #[instrument(skip(self))]
    pub async fn prune(&self) -> Result<usize> {
        let mut list = self.backend.list_checkpoints().await?;
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let stale: Vec<_> = list.split_off(self.max_checkpoints.min(list.len()));
        for descriptor in &stale {
            self.backend.delete(&descriptor.id).await?;
        }
        Ok(stale.len())
    }

    pub async fn list(&self) -> Result<Vec<CheckpointDescriptor>> {
        self.backend.list_checkpoints().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot() -> HashMap<TaskId, Task> {
        HashMap::new()
    }

    #[tokio::test]
    async fn create_then_restore_round_trips() {
        let manager = CheckpointManager::new(Box::new(InMemoryCheckpointStore::new()), 10);
        let id = manager
            .create(
                SessionId::from("s1"),
                empty_snapshot(),
                CheckpointType::Manual,
            )
            .await
            .unwrap();
        let restored = manager.restore(&id).await.unwrap();
        assert!(restored.is_empty());
    }

    #[tokio::test]
    async fn prune_keeps_only_the_newest() {
        let manager = CheckpointManager::new(Box::new(InMemoryCheckpointStore::new()), 2);
        for _ in 0..5 {
            manager
                .create(
                    SessionId::from("s1"),
                    empty_snapshot(),
                    CheckpointType::Automatic,
                )
                .await
                .unwrap();
        }
        let list = manager.list().await.unwrap();
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn file_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let atomic = AtomicStore::new(dir.path(), crate::atomic_store::LockPolicy::default());
        let manager = CheckpointManager::new(Box::new(FileCheckpointStore::new(atomic)), 10);
        let id = manager
            .create(
                SessionId::from("s1"),
                empty_snapshot(),
                CheckpointType::Manual,
            )
            .await
            .unwrap();
        let restored = manager.restore(&id).await.unwrap();
        assert!(restored.is_empty());
    }
}
