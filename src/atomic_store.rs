//! Primitive atomic read/write/locking over the file system.
//!
//! Every other component goes through [`AtomicStore`] to touch disk. It
//! never understands tasks, sessions, or checkpoints — only bytes, paths,
//! and the write-temp/rename/lock protocol described in the module docs
//! below, adapted from the write-temp-then-rename pattern in
//! `examples/onepointking-minisql/src/storage.rs` and the PID lock-file
//! protocol in `examples/other_examples/*oddjobs*lifecycle-mod.rs`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs as tfs;
use tokio::task;
use tracing::{debug, instrument, warn};

/// Errors raised by the [`AtomicStore`] primitives.
#[derive(Debug, Error, Diagnostic)]
pub enum AtomicStoreError {
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(code(taskvault::atomic_store::io))]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("timed out acquiring lock on {path} after {attempts} attempts")]
    #[diagnostic(code(taskvault::atomic_store::lock_timeout))]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("failed to roll back {path} after a failed write: {reason}")]
    #[diagnostic(
        code(taskvault::atomic_store::rollback_failed),
        help("the store has entered a fatal state; refuse further writes")
    )]
    RollbackFailed { path: PathBuf, reason: String },

    #[error("content at {path} failed structural validation: {reason}")]
    #[diagnostic(code(taskvault::atomic_store::invalid_content))]
    InvalidContent { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    #[diagnostic(code(taskvault::atomic_store::serde))]
    Serde(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, AtomicStoreError>;

fn io_err(path: &Path, source: io::Error) -> AtomicStoreError {
    AtomicStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Tuning knobs for lock acquisition and reaping, mirrored from
/// [`crate::config::StoreConfig`] so `AtomicStore` has no dependency on it.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub stale_threshold: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(5 * 60),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    pid: u32,
    lock_id: String,
    acquired_at: DateTime<Utc>,
}

/// Options controlling how [`AtomicStore::atomic_read`] validates content
/// before returning it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub require_valid_json: bool,
}

/// Atomic, lock-protected access to files under a persistence root.
///
/// `AtomicStore` is cheap to clone (it holds only a root path and a
/// policy) and is safe to share across tasks; the actual mutual exclusion
/// lives in sibling `.lock.*` files on disk, not in any in-process lock,
/// because cooperating processes (not just threads) must be serialized.
#[derive(Debug, Clone)]
pub struct AtomicStore {
    root: PathBuf,
    policy: LockPolicy,
}

impl AtomicStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, policy: LockPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a file name relative to the persistence root.
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    #[instrument(skip(self, bytes), fields(path = %path.display()))]
    pub async fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tfs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let tmp = path.with_extension(format!(
            "tmp.{}",
            uuid::Uuid::new_v4().simple()
        ));
        tfs::write(&tmp, bytes).await.map_err(|e| io_err(&tmp, e))?;
        tfs::rename(&tmp, path).await.map_err(|e| io_err(path, e))?;
        debug!(bytes = bytes.len(), "atomic write committed");
        Ok(())
    }

    #[instrument(skip(self, options), fields(path = %path.display()))]
    pub async fn atomic_read(&self, path: &Path, options: ReadOptions) -> Result<Vec<u8>> {
        let bytes = tfs::read(path).await.map_err(|e| io_err(path, e))?;
        if options.require_valid_json {
            serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|e| {
                AtomicStoreError::InvalidContent {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(bytes)
    }

    /// Acquire an exclusive advisory lock on `path`, run `op`, and guarantee
    /// release on every exit path (including panics, via `Drop`).
    #[instrument(skip(self, op), fields(path = %path.display()))]
    pub async fn with_exclusive_lock<F, T>(&self, path: &Path, op: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.acquire_lock(path).await?;
        let result = task::spawn_blocking(op)
            .await
            .expect("lock-protected closure panicked");
        drop(guard);
        Ok(result)
    }

    /// Combined backup → write → rename → cleanup transaction. On any
    /// failure the original file is restored bit-for-bit and the backup is
    /// removed.
    #[instrument(skip(self, data), fields(path = %path.display()))]
    pub async fn transaction(&self, path: &Path, data: &[u8]) -> Result<()> {
        let lock_path = self.lock_path(path);
        let _guard = self.acquire_lock(&lock_path).await?;
        self.transaction_locked(path, data).await
    }

    async fn transaction_locked(&self, path: &Path, data: &[u8]) -> Result<()> {
        let backup_path = path.with_extension(format!(
            "backup.{}",
            uuid::Uuid::new_v4().simple()
        ));
        let had_original = tfs::try_exists(path).await.map_err(|e| io_err(path, e))?;
        if had_original {
            tfs::copy(path, &backup_path)
                .await
                .map_err(|e| io_err(&backup_path, e))?;
        }

        match self.atomic_write(path, data).await {
            Ok(()) => {
                if had_original {
                    let _ = tfs::remove_file(&backup_path).await;
                }
                Ok(())
            }
            Err(write_err) => {
                if had_original {
                    if let Err(restore_err) = tfs::copy(&backup_path, path).await {
                        return Err(AtomicStoreError::RollbackFailed {
                            path: path.to_path_buf(),
                            reason: format!(
                                "write failed ({write_err}) and restore failed ({restore_err})"
                            ),
                        });
                    }
                    let _ = tfs::remove_file(&backup_path).await;
                }
                Err(write_err)
            }
        }
    }

    fn lock_path(&self, path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".lock");
        path.with_file_name(name)
    }

    async fn acquire_lock(&self, lock_path: &Path) -> Result<LockGuard> {
        if let Some(parent) = lock_path.parent() {
            tfs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let lock_id = uuid::Uuid::new_v4().to_string();
        let deadline = SystemTime::now() + self.policy.timeout;
        let mut backoff = self.policy.initial_backoff;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let lock_path_owned = lock_path.to_path_buf();
            let lock_id_owned = lock_id.clone();
            let stale_threshold = self.policy.stale_threshold;
            let acquired = task::spawn_blocking(move || {
                try_acquire_blocking(&lock_path_owned, &lock_id_owned, stale_threshold)
            })
            .await
            .expect("lock task panicked")?;

            if let Some(file) = acquired {
                return Ok(LockGuard {
                    path: lock_path.to_path_buf(),
                    _file: file,
                });
            }

            if SystemTime::now() >= deadline {
                return Err(AtomicStoreError::LockTimeout {
                    path: lock_path.to_path_buf(),
                    attempts,
                });
            }
            let jitter_ms = rand::random::<u64>() % (backoff.as_millis() as u64 / 2 + 1);
            tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }
    }
}

/// Blocking half of lock acquisition, run on a blocking thread because
/// `fs2`'s exclusive lock is a syscall with no async equivalent.
fn try_acquire_blocking(
    lock_path: &Path,
    lock_id: &str,
    stale_threshold: Duration,
) -> Result<Option<std::fs::File>> {
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| io_err(lock_path, e))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            file.set_len(0).map_err(|e| io_err(lock_path, e))?;
            let record = LockFile {
                pid: std::process::id(),
                lock_id: lock_id.to_string(),
                acquired_at: Utc::now(),
            };
            let json = serde_json::to_vec(&record)?;
            file.write_all(&json).map_err(|e| io_err(lock_path, e))?;
            file.sync_all().map_err(|e| io_err(lock_path, e))?;
            Ok(Some(file))
        }
        Err(_) => {
            let mut contents = String::new();
            file.seek(SeekFrom::Start(0))
                .map_err(|e| io_err(lock_path, e))?;
            if file.read_to_string(&mut contents).is_ok() {
                if let Ok(existing) = serde_json::from_str::<LockFile>(&contents) {
                    let age = Utc::now()
                        .signed_duration_since(existing.acquired_at)
                        .to_std()
                        .unwrap_or_default();
                    let holder_alive = pid_alive(existing.pid);
                    if age > stale_threshold || !holder_alive {
                        warn!(
                            holder_pid = existing.pid,
                            age_secs = age.as_secs(),
                            "reaping stale lock"
                        );
                        return try_acquire_blocking_after_reap(lock_path, lock_id);
                    }
                }
            }
            Ok(None)
        }
    }
}

fn try_acquire_blocking_after_reap(
    lock_path: &Path,
    lock_id: &str,
) -> Result<Option<std::fs::File>> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(lock_path)
        .map_err(|e| io_err(lock_path, e))?;
    file.try_lock_exclusive().map_err(|e| io_err(lock_path, e))?;
    let record = LockFile {
        pid: std::process::id(),
        lock_id: lock_id.to_string(),
        acquired_at: Utc::now(),
    };
    let json = serde_json::to_vec(&record)?;
    file.write_all(&json).map_err(|e| io_err(lock_path, e))?;
    file.sync_all().map_err(|e| io_err(lock_path, e))?;
    Ok(Some(file))
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No portable liveness probe off unix; assume alive so we never reap a
    // lock held by a process we can't actually check.
    true
}

struct LockGuard {
    path: PathBuf,
    _file: std::fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::new(dir.path(), LockPolicy::default());
        let path = store.path_for("thing.json");
        store.atomic_write(&path, b"{\"a\":1}").await.unwrap();
        let bytes = store
            .atomic_read(&path, ReadOptions { require_valid_json: true })
            .await
            .unwrap();
        assert_eq!(bytes, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn transaction_restores_on_failed_validation_caller_side() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::new(dir.path(), LockPolicy::default());
        let path = store.path_for("thing.json");
        store.transaction(&path, b"{\"a\":1}").await.unwrap();
        store.transaction(&path, b"{\"a\":2}").await.unwrap();
        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes, b"{\"a\":2}");
    }

    #[tokio::test]
    async fn lock_is_released_after_use() {
        let dir = tempdir().unwrap();
        let store = AtomicStore::new(dir.path(), LockPolicy::default());
        let path = store.path_for("locked.json");
        store
            .with_exclusive_lock(&path, || 1 + 1)
            .await
            .unwrap();
        // A second acquisition must succeed promptly, proving the guard released.
        store
            .with_exclusive_lock(&path, || 2 + 2)
            .await
            .unwrap();
    }
}
