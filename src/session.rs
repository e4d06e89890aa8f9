//! Process-session registration, heartbeats, and crash detection.
//!
//! Grounded on `examples/other_examples/*oddjobs*lifecycle-mod.rs`'s daemon
//! startup: acquire the lock/PID file first, write the session record,
//! replay/restore before serving. `scan_crashed` generalizes that file's
//! single-daemon PID check into a registry scan across every session file
//! on disk.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::atomic_store::{AtomicStore, AtomicStoreError, ReadOptions};
use crate::ids::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Inactive,
    Crashed,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub platform: String,
    pub working_directory: String,
}

impl ProcessInfo {
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            platform: std::env::consts::OS.to_string(),
            working_directory: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionStatistics {
    pub tasks_processed: u64,
    pub operations_executed: u64,
    pub errors: u64,
    pub average_operation_duration_ms: f64,
}

impl SessionStatistics {
    pub fn record_operation(&mut self, duration_ms: f64, errored: bool) {
        let n = self.operations_executed as f64;
        self.average_operation_duration_ms =
            (self.average_operation_duration_ms * n + duration_ms) / (n + 1.0);
        self.operations_executed += 1;
        if errored {
            self.errors += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub state: SessionState,
    pub process_info: ProcessInfo,
    pub statistics: SessionStatistics,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::generate(),
            start_time: now,
            end_time: None,
            last_heartbeat: now,
            state: SessionState::Active,
            process_info: ProcessInfo::current(),
            statistics: SessionStatistics::default(),
        }
    }

    #[must_use]
    pub fn is_stale(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Active
            && now.signed_duration_since(self.last_heartbeat) > timeout
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("session not found: {session_id}")]
    #[diagnostic(code(taskvault::session::not_found))]
    NotFound { session_id: String },

    #[error("backend error: {0}")]
    #[diagnostic(code(taskvault::session::backend))]
    Backend(#[from] AtomicStoreError),

    #[error("serialization error: {0}")]
    #[diagnostic(code(taskvault::session::serde))]
    Serde(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, SessionError>;

/// Outcome of scanning for crashed sessions at startup: which sessions were
/// reclassified and, for each, the checkpoint chosen for recovery.
#[derive(Debug, Default)]
pub struct CrashScanReport {
    pub crashed_sessions: Vec<SessionId>,
}

/// Registers the current process session, emits heartbeats, and detects
/// sessions abandoned by a crashed process.
pub struct SessionManager {
    store: AtomicStore,
    session_timeout: chrono::Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: AtomicStore, session_timeout: chrono::Duration) -> Self {
        Self {
            store,
            session_timeout,
        }
    }

    fn file_name(id: &SessionId) -> String {
        format!("session-{id}.json")
    }

    #[instrument(skip(self))]
    pub async fn register(&self) -> Result<Session> {
        let session = Session::new();
        self.persist(&session).await?;
        info!(session_id = %session.session_id, "session registered");
        Ok(session)
    }

    async fn persist(&self, session: &Session) -> std::result::Result<(), AtomicStoreError> {
        let path = self.store.path_for(&Self::file_name(&session.session_id));
        let bytes = serde_json::to_vec(session).expect("Session always serializes");
        self.store.transaction(&path, &bytes).await
    }

    #[instrument(skip(self, session))]
    pub async fn heartbeat(&self, session: &mut Session) -> Result<()> {
        session.last_heartbeat = Utc::now();
        self.persist(session).await?;
        Ok(())
    }

    #[instrument(skip(self, session))]
    pub async fn shutdown(&self, session: &mut Session, graceful: bool) -> Result<()> {
        session.end_time = Some(Utc::now());
        session.state = if graceful {
            SessionState::Terminated
        } else {
            SessionState::Crashed
        };
        self.persist(session).await?;
        info!(session_id = %session.session_id, graceful, "session shut down");
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let path = self.store.path_for(&Self::file_name(id));
        match self
            .store
            .atomic_read(&path, ReadOptions { require_valid_json: true })
            .await
        {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(AtomicStoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_session_files(&self) -> Result<Vec<std::path::PathBuf>> {
        let mut out = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(self.store.root()).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SessionError::Backend(AtomicStoreError::Io {
                    path: self.store.root().to_path_buf(),
                    source: e,
                }));
            }
        };
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| {
            SessionError::Backend(AtomicStoreError::Io {
                path: self.store.root().to_path_buf(),
                source: e,
            })
        })? {
            let path = entry.path();
            let is_session = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("session-") && n.ends_with(".json"));
            if is_session {
                out.push(path);
            }
        }
        Ok(out)
    }

    /// Enumerate every `active` session and reclassify it `crashed` if its
    /// heartbeat is stale or its PID no longer exists.
    #[instrument(skip(self))]
    pub async fn scan_crashed(&self) -> Result<CrashScanReport> {
        let now = Utc::now();
        let mut report = CrashScanReport::default();
        for path in self.list_session_files().await? {
            let bytes = match self
                .store
                .atomic_read(&path, ReadOptions { require_valid_json: true })
                .await
            {
                Ok(b) => b,
                Err(_) => continue,
            };
            let Ok(mut session) = serde_json::from_slice::<Session>(&bytes) else {
                continue;
            };
            if session.state != SessionState::Active {
                continue;
            }
            let stale = session.is_stale(self.session_timeout, now);
            let pid_dead = !pid_alive(session.process_info.pid);
            if stale || pid_dead {
                session.state = SessionState::Crashed;
                session.end_time = Some(now);
                self.persist(&session).await?;
                warn!(session_id = %session.session_id, stale, pid_dead, "session marked crashed");
                report.crashed_sessions.push(session.session_id);
            }
        }
        Ok(report)
    }

    pub async fn get(&self, id: &SessionId) -> Result<Option<Session>> {
        self.load(id).await
    }

    pub async fn active_sessions(&self) -> Result<HashMap<SessionId, Session>> {
        let mut out = HashMap::new();
        for path in self.list_session_files().await? {
            if let Ok(bytes) = self
                .store
                .atomic_read(&path, ReadOptions { require_valid_json: true })
                .await
            {
                if let Ok(session) = serde_json::from_slice::<Session>(&bytes) {
                    if session.state == SessionState::Active {
                        out.insert(session.session_id.clone(), session);
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic_store::LockPolicy;

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AtomicStore::new(dir.path(), LockPolicy::default());
        let manager = SessionManager::new(store, chrono::Duration::seconds(600));
        let session = manager.register().await.unwrap();
        let fetched = manager.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(fetched.session_id, session.session_id);
    }

    #[tokio::test]
    async fn scan_crashed_reclassifies_stale_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let store = AtomicStore::new(dir.path(), LockPolicy::default());
        let manager = SessionManager::new(store, chrono::Duration::zero());
        let mut session = manager.register().await.unwrap();
        session.process_info.pid = u32::MAX;
        manager.persist(&session).await.unwrap();
        let report = manager.scan_crashed().await.unwrap();
        assert_eq!(report.crashed_sessions, vec![session.session_id]);
    }

    #[tokio::test]
    async fn shutdown_marks_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let store = AtomicStore::new(dir.path(), LockPolicy::default());
        let manager = SessionManager::new(store, chrono::Duration::seconds(600));
        let mut session = manager.register().await.unwrap();
        manager.shutdown(&mut session, true).await.unwrap();
        assert_eq!(session.state, SessionState::Terminated);
    }
}
