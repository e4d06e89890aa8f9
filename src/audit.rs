//! Append-only, hash-chained audit trail.
//!
//! Entries are JSONL — one object per line — opened for append rather
//! than truncation, and paired with a small `.chainstate` sidecar
//! (`{last_hash, entry_count}`) so a fresh process can resume appending
//! without replaying the whole log.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs as tfs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::checksum::{self, GENESIS_HASH};
use crate::ids::{AuditEntryId, SessionId, TaskId};

#[derive(Debug, Error, Diagnostic)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(taskvault::audit::io))]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    #[diagnostic(code(taskvault::audit::serde))]
    Serde(#[from] serde_json::Error),

    #[error("hash chain broken at entry {entry_id}: expected previous_hash {expected}, found {found}")]
    #[diagnostic(code(taskvault::audit::chain_broken))]
    ChainBroken {
        entry_id: String,
        expected: String,
        found: String,
    },
}

type Result<T> = std::result::Result<T, AuditError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
    pub previous_hash: String,
    pub this_hash: String,
}

impl AuditEntry {
    fn task_id(&self) -> Option<&str> {
        self.payload.get("task_id").and_then(|v| v.as_str())
    }

    fn session_id(&self) -> Option<&str> {
        self.payload.get("session_id").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_types: Option<Vec<String>>,
    pub task_id: Option<TaskId>,
    pub session_id: Option<SessionId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == &entry.event_type) {
                return false;
            }
        }
        if let Some(task_id) = &self.task_id {
            if entry.task_id() != Some(task_id.as_str()) {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if entry.session_id() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainState {
    last_hash: String,
    entry_count: u64,
}

/// Appends audit entries and verifies/replays the chain.
///
/// The rolling `previous_hash` is held in memory (mirrored to the
/// `.chainstate` sidecar after every append) so `append` never has to
/// re-read the whole log just to learn the last hash.
pub struct AuditLog {
    log_path: PathBuf,
    chainstate_path: PathBuf,
    state: Arc<Mutex<ChainState>>,
}

impl AuditLog {
    /// Open (or create) an audit log at `log_path`, resuming the chain
    /// from `chainstate_path` if present, or by replaying `log_path`'s
    /// last line as a fallback.
    ///
    /// # Errors
    /// Returns an error if the existing log exists but cannot be read.
    pub async fn open(log_path: PathBuf, chainstate_path: PathBuf) -> Result<Self> {
        let state = if let Ok(bytes) = tfs::read(&chainstate_path).await {
            serde_json::from_slice(&bytes).unwrap_or(ChainState {
                last_hash: GENESIS_HASH.to_string(),
                entry_count: 0,
            })
        } else if let Ok(bytes) = tfs::read(&log_path).await {
            Self::recover_state_from_log(&bytes)
        } else {
            ChainState {
                last_hash: GENESIS_HASH.to_string(),
                entry_count: 0,
            }
        };
        Ok(Self {
            log_path,
            chainstate_path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn recover_state_from_log(bytes: &[u8]) -> ChainState {
        let mut last_hash = GENESIS_HASH.to_string();
        let mut count = 0u64;
        for line in bytes.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_slice::<AuditEntry>(line) {
                last_hash = entry.this_hash;
                count += 1;
            }
        }
        ChainState {
            last_hash,
            entry_count: count,
        }
    }

    /// Append one entry; returns the committed entry including its hash.
    ///
    /// # Errors
    /// Returns an error on I/O failure or if `payload` cannot be canonicalized.
    #[instrument(skip(self, payload), fields(event_type = %event_type))]
    pub async fn append(&self, event_type: &str, payload: Value) -> Result<AuditEntry> {
        let id = AuditEntryId::generate();
        let timestamp = Utc::now();
        let canonical_payload = checksum::canonical_json(&payload)?;
        let previous_hash = self.state.lock().last_hash.clone();
        let this_hash = checksum::chain_hash(
            id.as_str(),
            &timestamp.to_rfc3339(),
            event_type,
            &canonical_payload,
            &previous_hash,
        );
        let entry = AuditEntry {
            id,
            timestamp,
            event_type: event_type.to_string(),
            payload,
            previous_hash,
            this_hash: this_hash.clone(),
        };

        let line = serde_json::to_string(&entry)?;
        if let Some(parent) = self.log_path.parent() {
            tfs::create_dir_all(parent).await?;
        }
        let mut file = tfs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        let new_state = {
            let mut state = self.state.lock();
            state.last_hash = this_hash;
            state.entry_count += 1;
            state.clone()
        };
        let chainstate_bytes = serde_json::to_vec(&new_state)?;
        tfs::write(&self.chainstate_path, chainstate_bytes).await?;

        Ok(entry)
    }

    /// Read every entry, applying `filter`, ordered by ascending timestamp.
    ///
    /// # Errors
    /// Returns an error if the log exists but cannot be read or parsed.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let entries = self.read_all().await?;
        let mut matched: Vec<_> = entries.into_iter().filter(|e| filter.matches(e)).collect();
        matched.sort_by_key(|e| e.timestamp);
        Ok(matched)
    }

    async fn read_all(&self) -> Result<Vec<AuditEntry>> {
        match tfs::read(&self.log_path).await {
            Ok(bytes) => {
                let reader = BufReader::new(bytes.as_slice());
                let mut entries = Vec::new();
                for line in reader.lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    entries.push(serde_json::from_str(&line)?);
                }
                Ok(entries)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Walk the log recomputing hashes; returns the first broken link, if any.
    ///
    /// # Errors
    /// Returns an error if the log exists but cannot be read or parsed.
    pub async fn verify_chain(&self) -> Result<Option<AuditError>> {
        let entries = self.read_all().await?;
        let mut expected_previous = GENESIS_HASH.to_string();
        for entry in &entries {
            if entry.previous_hash != expected_previous {
                return Ok(Some(AuditError::ChainBroken {
                    entry_id: entry.id.to_string(),
                    expected: expected_previous,
                    found: entry.previous_hash.clone(),
                }));
            }
            let canonical_payload = checksum::canonical_json(&entry.payload)?;
            let recomputed = checksum::chain_hash(
                entry.id.as_str(),
                &entry.timestamp.to_rfc3339(),
                &entry.event_type,
                &canonical_payload,
                &entry.previous_hash,
            );
            if recomputed != entry.this_hash {
                return Ok(Some(AuditError::ChainBroken {
                    entry_id: entry.id.to_string(),
                    expected: entry.this_hash.clone(),
                    found: recomputed,
                }));
            }
            expected_previous = entry.this_hash.clone();
        }
        Ok(None)
    }

    /// Fold `task_*` mutation events for `task_id` up to `at_time` into a
    /// reconstructed JSON value of the task as it existed at that time.
    ///
    /// # Errors
    /// Returns an error if the log exists but cannot be read or parsed.
    pub async fn reconstruct_task(
        &self,
        task_id: &TaskId,
        at_time: DateTime<Utc>,
    ) -> Result<Option<Value>> {
        let entries = self.read_all().await?;
        let mut state: Option<Value> = None;
        for entry in entries
            .into_iter()
            .filter(|e| e.task_id() == Some(task_id.as_str()) && e.timestamp <= at_time)
        {
            match entry.event_type.as_str() {
                "task_created" => {
                    state = entry.payload.get("task").cloned();
                }
                "task_updated" => {
                    if let Some(new_task) = entry.payload.get("task") {
                        state = Some(new_task.clone());
                    }
                }
                "task_deleted" => {
                    if let Some(existing) = state.as_mut() {
                        if let Some(obj) = existing.as_object_mut() {
                            obj.insert("deleted".to_string(), Value::Bool(true));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn chain_links_successive_entries() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(
            dir.path().join("audit.jsonl"),
            dir.path().join("audit.chainstate"),
        )
        .await
        .unwrap();
        let e1 = log.append("task_created", json!({"task_id": "t1"})).await.unwrap();
        let e2 = log.append("task_updated", json!({"task_id": "t1"})).await.unwrap();
        assert_eq!(e2.previous_hash, e1.this_hash);
        assert!(log.verify_chain().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resumes_chain_after_reopen() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("audit.jsonl");
        let chainstate_path = dir.path().join("audit.chainstate");
        {
            let log = AuditLog::open(log_path.clone(), chainstate_path.clone())
                .await
                .unwrap();
            log.append("task_created", json!({"task_id": "t1"})).await.unwrap();
        }
        let log2 = AuditLog::open(log_path, chainstate_path).await.unwrap();
        let e2 = log2.append("task_updated", json!({"task_id": "t1"})).await.unwrap();
        assert_ne!(e2.previous_hash, GENESIS_HASH);
        assert!(log2.verify_chain().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_filters_by_task_id() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(
            dir.path().join("audit.jsonl"),
            dir.path().join("audit.chainstate"),
        )
        .await
        .unwrap();
        log.append("task_created", json!({"task_id": "t1"})).await.unwrap();
        log.append("task_created", json!({"task_id": "t2"})).await.unwrap();
        let filtered = log
            .query(&AuditFilter {
                task_id: Some(TaskId::from("t2")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }
}
