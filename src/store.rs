//! [`TaskStore`]: the public façade composing every sub-component.
//!
//! One struct holding `Arc`-shared collaborators behind a facade, with
//! `#[instrument]` on every public method.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::atomic_store::{AtomicStore, LockPolicy, ReadOptions};
use crate::audit::{AuditFilter, AuditLog};
use crate::cache::{Cache, CacheStats};
use crate::checkpoint::{
    CheckpointDescriptor, CheckpointManager, CheckpointStore, CheckpointType, FileCheckpointStore,
};
use crate::config::{StorageLayout, StoreConfig};
use crate::error::{Result, StoreError};
use crate::events::{Event, EventBus, EventKind};
use crate::ids::{SessionId, TaskId};
use crate::integrity::IntegrityEngine;
use crate::session::{Session, SessionManager};
use crate::task::{HistoryEntry, Task, TaskDraft, TaskPatch, TaskStatus};

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub tag: Option<String>,
    pub id_contains: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy)]
pub enum SortField {
    Priority,
    CreatedAt,
    UpdatedAt,
    Id,
}

#[derive(Debug, Clone, Copy)]
pub struct Sort {
    pub field: SortField,
    pub order: SortOrder,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: SortField::Id,
            order: SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 50 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListPage {
    pub items: Vec<Task>,
    pub total: usize,
    pub filtered: usize,
    pub page_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub producing_session: SessionId,
    pub files: Vec<BackupFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFileEntry {
    pub name: String,
    pub size_bytes: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub label: String,
    pub files_restored: usize,
    pub revalidated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub task_counts_by_status: HashMap<String, usize>,
    pub cache: CacheStats,
    pub last_checkpoint: Option<CheckpointDescriptor>,
    pub active_sessions: usize,
    pub audit_chain_ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PrimaryDocument {
    version: u64,
    tasks: Vec<Task>,
    metadata: PrimaryMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct PrimaryMetadata {
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    task_count: usize,
    checksum: String,
}

/// The durable, crash-tolerant task store. Composes [`AtomicStore`],
/// [`IntegrityEngine`], [`AuditLog`], [`Cache`], [`CheckpointManager`], and
/// [`SessionManager`] behind one facade.
pub struct TaskStore {
    config: StoreConfig,
    atomic_store: AtomicStore,
    integrity: IntegrityEngine,
    audit: AuditLog,
    cache: Cache<Task>,
    checkpoints: CheckpointManager,
    sessions: SessionManager,
    events: Arc<EventBus>,
    tasks: SyncRwLock<HashMap<TaskId, Task>>,
    session: AsyncMutex<Session>,
    operations_since_checkpoint: AtomicU64,
    /// Last-known-good snapshot, refreshed on every checkpoint. Backs the
    /// `BackupRestore` repair strategy's lookup without needing the engine
    /// to hold an async handle back into `CheckpointManager`.
    last_checkpoint_snapshot: Arc<SyncRwLock<Option<HashMap<TaskId, Task>>>>,
}

impl TaskStore {
    /// Initialize the store: create the persistence directory, open the
    /// audit log, register this process's session, run crash recovery if
    /// configured, and load the task map from disk.
    ///
    /// # Errors
    /// Returns an error if the persistence directory cannot be created or
    /// existing state cannot be read.
    #[instrument(skip(config, events))]
    pub async fn open(config: StoreConfig, events: Arc<EventBus>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.persistence_directory)
            .await
            .map_err(|source| StoreError::PersistError(source.to_string()))?;

        let lock_policy = LockPolicy {
            timeout: config.lock_timeout(),
            stale_threshold: config.lock_stale_threshold(),
            ..LockPolicy::default()
        };
        let atomic_store = AtomicStore::new(&config.persistence_directory, lock_policy);
        let audit = AuditLog::open(config.audit_log_path(), config.audit_chainstate_path()).await?;
        let checkpoint_backend: Box<dyn CheckpointStore> = Box::new(FileCheckpointStore::new(
            AtomicStore::new(&config.persistence_directory, lock_policy),
        ));
        let checkpoints = CheckpointManager::new(checkpoint_backend, config.max_checkpoints);
        let sessions = SessionManager::new(
            AtomicStore::new(&config.persistence_directory, lock_policy),
            ChronoDuration::milliseconds(config.session_timeout_ms as i64),
        );
        let integrity = IntegrityEngine::with_defaults(config.validation_level, config.auto_repair);
        let cache = Cache::new(config.cache_size, config.cache_ttl());
        let last_checkpoint_snapshot: Arc<SyncRwLock<Option<HashMap<TaskId, Task>>>> =
            Arc::new(SyncRwLock::new(None));
        {
            let snapshot_handle = last_checkpoint_snapshot.clone();
            integrity.set_backup_lookup(Box::new(move |id: &str| {
                snapshot_handle
                    .read()
                    .as_ref()
                    .and_then(|snapshot| snapshot.get(&TaskId::from(id)))
                    .cloned()
            }));
        }

        let session = sessions.register().await?;

        let mut tasks = HashMap::new();
        if config.crash_recovery_enabled {
            let report = sessions.scan_crashed().await?;
            for crashed_id in &report.crashed_sessions {
                if let Some((_checkpoint_id, snapshot)) = checkpoints
                    .restore_latest_for_session(crashed_id)
                    .await?
                {
                    tasks = snapshot;
                    events.emit(Event::new(
                        session.session_id.clone(),
                        EventKind::CrashDetected,
                        json!({"session_id": crashed_id.to_string()}),
                    ));
                    audit
                        .append(
                            "crash-recovery-completed",
                            json!({"session_id": crashed_id.to_string()}),
                        )
                        .await?;
                    events.emit(Event::new(
                        session.session_id.clone(),
                        EventKind::CrashRecoveryCompleted,
                        json!({"session_id": crashed_id.to_string()}),
                    ));
                }
            }
        }
        if tasks.is_empty() {
            tasks = Self::load_from_disk(&atomic_store, &config).await?;
        }
        *last_checkpoint_snapshot.write() = Some(tasks.clone());

        events.emit(Event::new(
            session.session_id.clone(),
            EventKind::Initialized,
            json!({"task_count": tasks.len()}),
        ));

        Ok(Self {
            config,
            atomic_store,
            integrity,
            audit,
            cache,
            checkpoints,
            sessions,
            events,
            tasks: SyncRwLock::new(tasks),
            session: AsyncMutex::new(session),
            operations_since_checkpoint: AtomicU64::new(0),
            last_checkpoint_snapshot,
        })
    }

    async fn load_from_disk(
        atomic_store: &AtomicStore,
        config: &StoreConfig,
    ) -> Result<HashMap<TaskId, Task>> {
        match config.storage_layout {
            StorageLayout::SingleFile => {
                let path = atomic_store.path_for(&config.primary_file_name);
                match atomic_store
                    .atomic_read(&path, ReadOptions { require_valid_json: true })
                    .await
                {
                    Ok(bytes) => {
                        let doc: PrimaryDocument = serde_json::from_slice(&bytes)?;
                        Ok(doc.tasks.into_iter().map(|t| (t.id.clone(), t)).collect())
                    }
                    Err(_) => Ok(HashMap::new()),
                }
            }
            StorageLayout::PerTask => {
                let mut out = HashMap::new();
                let mut read_dir = match tokio::fs::read_dir(atomic_store.root()).await {
                    Ok(rd) => rd,
                    Err(_) => return Ok(out),
                };
                while let Ok(Some(entry)) = read_dir.next_entry().await {
                    let path = entry.path();
                    let is_task_file = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("task-") && n.ends_with(".json"));
                    if !is_task_file {
                        continue;
                    }
                    if let Ok(bytes) = atomic_store
                        .atomic_read(&path, ReadOptions { require_valid_json: true })
                        .await
                    {
                        if let Ok(task) = serde_json::from_slice::<Task>(&bytes) {
                            out.insert(task.id.clone(), task);
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    async fn persist_single_task(&self, task: &Task) -> Result<()> {
        match self.config.storage_layout {
            StorageLayout::PerTask => {
                let path = self.config.task_file_path(task.id.as_str());
                let bytes = serde_json::to_vec(task)?;
                self.atomic_store.transaction(&path, &bytes).await?;
            }
            StorageLayout::SingleFile => {
                self.persist_primary_document().await?;
            }
        }
        Ok(())
    }

    async fn persist_primary_document(&self) -> Result<()> {
        let tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        let checksum = crate::checksum::digest(&tasks)?;
        let doc = PrimaryDocument {
            version: 1,
            metadata: PrimaryMetadata {
                created: Utc::now(),
                updated: Utc::now(),
                task_count: tasks.len(),
                checksum,
            },
            tasks,
        };
        let path = self.config.primary_file_path();
        let bytes = serde_json::to_vec(&doc)?;
        self.atomic_store.transaction(&path, &bytes).await?;
        Ok(())
    }

    fn known_task_ids_predicate<'a>(
        snapshot: &'a HashMap<TaskId, Task>,
    ) -> impl Fn(&str) -> bool + 'a {
        move |id: &str| snapshot.contains_key(&TaskId::from(id))
    }

    /// A commit that would introduce a dependency cycle fails validation;
    /// detected via a bounded DFS from the candidate over the current map.
    fn introduces_cycle(snapshot: &HashMap<TaskId, Task>, candidate: &Task) -> bool {
        let mut visited = std::collections::HashSet::new();
        visited.insert(candidate.id.clone());
        let mut frontier: Vec<TaskId> = candidate.dependencies.iter().cloned().collect();
        while let Some(dep) = frontier.pop() {
            if dep == candidate.id {
                return true;
            }
            if !visited.insert(dep.clone()) {
                continue;
            }
            if let Some(task) = snapshot.get(&dep) {
                frontier.extend(task.dependencies.iter().cloned());
            }
        }
        false
    }

    /// Force a manual checkpoint outside the automatic timer/counter path.
    ///
    /// # Errors
    /// Propagates checkpoint persistence failures.
    #[instrument(skip(self))]
    pub async fn checkpoint(&self) -> Result<crate::ids::CheckpointId> {
        let session_id = self.session.lock().await.session_id.clone();
        let snapshot = self.tasks.read().clone();
        let id = self
            .checkpoints
            .create(session_id.clone(), snapshot.clone(), CheckpointType::Manual)
            .await?;
        *self.last_checkpoint_snapshot.write() = Some(snapshot);
        self.events.emit(Event::new(
            session_id,
            EventKind::CheckpointCreated,
            json!({"checkpoint_id": id.to_string()}),
        ));
        Ok(id)
    }

    /// The timer half of the two-trigger checkpoint policy (the other half
    /// is the operation counter in [`Self::maybe_checkpoint`]). The library
    /// never spawns this on its own — callers that want it running opt in
    /// by spawning it themselves, keeping background-loop lifecycle in the
    /// caller's hands rather than reaching for `tokio::spawn` internally.
    pub async fn run_checkpoint_timer(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.checkpoint_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(error) = self.checkpoint().await {
                tracing::error!(%error, "timer-triggered checkpoint failed");
            }
        }
    }

    /// Keeps this process's session marked alive by refreshing
    /// `last_heartbeat` on an interval, so [`SessionManager::scan_crashed`]
    /// run by a later process doesn't reclassify a live, slow-between-calls
    /// session as crashed. Caller-spawned, same discipline as
    /// [`Self::run_checkpoint_timer`].
    pub async fn run_heartbeat_timer(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut session = self.session.lock().await;
            if let Err(error) = self.sessions.heartbeat(&mut session).await {
                tracing::error!(%error, "heartbeat failed");
            }
        }
    }

    /// Evicts cache entries that aged past their TTL even if nothing ever
    /// reads them again, so a cold key doesn't sit in memory indefinitely.
    /// Caller-spawned, same discipline as [`Self::run_checkpoint_timer`].
    pub async fn run_cache_sweep_timer(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cache_sweep_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.cache.sweep_expired();
        }
    }

    async fn maybe_checkpoint(&self, session_id: &SessionId) -> Result<()> {
        let count = self.operations_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.checkpoint_operation_threshold {
            self.operations_since_checkpoint.store(0, Ordering::SeqCst);
            let snapshot = self.tasks.read().clone();
            let id = self
                .checkpoints
                .create(session_id.clone(), snapshot.clone(), CheckpointType::Automatic)
                .await?;
            *self.last_checkpoint_snapshot.write() = Some(snapshot);
            self.events.emit(Event::new(
                session_id.clone(),
                EventKind::CheckpointCreated,
                json!({"checkpoint_id": id.to_string()}),
            ));
        }
        Ok(())
    }

    /// Validate, assign an id, checksum, and persist a new task.
    ///
    /// # Errors
    /// `ValidationError` if a critical rule fails; `PersistError` on I/O failure.
    #[instrument(skip(self, draft))]
    pub async fn create(&self, draft: TaskDraft) -> Result<Task> {
        let op_started = Instant::now();
        let mut session = self.session.lock().await;
        let now = Utc::now();
        let mut task = Task {
            id: TaskId::generate(),
            name: draft.name,
            description: draft.description,
            task_type: draft.task_type,
            priority: draft.priority,
            status: draft.status.unwrap_or(TaskStatus::Pending),
            created_at: now,
            updated_at: now,
            tags: draft.tags,
            dependencies: draft.dependencies,
            execution_metadata: None,
            version: 1,
            checksum: String::new(),
            session_id: session.session_id.clone(),
            history_tail: Default::default(),
        };

        {
            let snapshot = self.tasks.read();
            if Self::introduces_cycle(&snapshot, &task) {
                return Err(StoreError::ValidationError(
                    "dependencies introduce a cycle".to_string(),
                ));
            }
            let known = Self::known_task_ids_predicate(&snapshot);
            let outcomes = self.integrity.validate(&task, &known);
            if self.integrity.blocks_commit(&outcomes) {
                return Err(StoreError::ValidationError(format!("{outcomes:?}")));
            }
        }

        task.checksum = task.compute_checksum();

        {
            let mut snapshot = self.tasks.write();
            snapshot.insert(task.id.clone(), task.clone());
        }
        self.persist_single_task(&task).await?;
        self.audit
            .append("task_created", json!({"task_id": task.id.to_string(), "task": task}))
            .await?;
        self.cache.set(task.id.as_str().to_string(), task.clone());
        self.events.emit(Event::new(
            session.session_id.clone(),
            EventKind::TaskStateSaved,
            json!({"task_id": task.id.to_string(), "op": "create"}),
        ));
        session.statistics.tasks_processed += 1;
        session
            .statistics
            .record_operation(op_started.elapsed().as_secs_f64() * 1000.0, false);
        let sid = session.session_id.clone();
        drop(session);
        self.maybe_checkpoint(&sid).await?;
        Ok(task)
    }

    /// Apply a partial patch to an existing task, bumping its version.
    ///
    /// # Errors
    /// `NotFound` if `id` is absent; `ValidationError` if the result would
    /// violate a critical rule.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        let op_started = Instant::now();
        let mut session = self.session.lock().await;
        let existing = {
            let snapshot = self.tasks.read();
            snapshot
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?
        };

        let changed_fields = patch.changed_fields();
        let mut updated = existing.clone();
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(description) = patch.description {
            updated.description = description;
        }
        if let Some(priority) = patch.priority {
            updated.priority = priority;
        }
        if let Some(status) = patch.status {
            updated.status = status;
        }
        if let Some(tags) = patch.tags {
            updated.tags = tags;
        }
        if let Some(dependencies) = patch.dependencies {
            updated.dependencies = dependencies;
        }
        if let Some(execution_metadata) = patch.execution_metadata {
            updated.execution_metadata = Some(execution_metadata);
        }
        updated.version = existing.version + 1;
        updated.updated_at = std::cmp::max(Utc::now(), existing.updated_at + ChronoDuration::milliseconds(1));
        updated.session_id = session.session_id.clone();
        updated.push_history(HistoryEntry {
            version: existing.version,
            timestamp: Utc::now(),
            changed_fields,
            session_id: session.session_id.clone(),
        });

        {
            let snapshot = self.tasks.read();
            if Self::introduces_cycle(&snapshot, &updated) {
                return Err(StoreError::ValidationError(
                    "dependencies introduce a cycle".to_string(),
                ));
            }
            let known = Self::known_task_ids_predicate(&snapshot);
            let outcomes = self.integrity.validate(&updated, &known);
            if self.integrity.blocks_commit(&outcomes) {
                return Err(StoreError::ValidationError(format!("{outcomes:?}")));
            } else if !outcomes.is_empty() {
                warn!(task_id = %updated.id, ?outcomes, "non-critical validation warnings");
            }
        }

        updated.checksum = updated.compute_checksum();

        {
            let mut snapshot = self.tasks.write();
            snapshot.insert(updated.id.clone(), updated.clone());
        }
        self.persist_single_task(&updated).await?;
        self.audit
            .append(
                "task_updated",
                json!({
                    "task_id": updated.id.to_string(),
                    "old_version": existing.version,
                    "new_version": updated.version,
                    "task": updated,
                }),
            )
            .await?;
        self.cache.set(updated.id.as_str().to_string(), updated.clone());
        self.events.emit(Event::new(
            session.session_id.clone(),
            EventKind::TaskStateSaved,
            json!({"task_id": updated.id.to_string(), "op": "update"}),
        ));
        session
            .statistics
            .record_operation(op_started.elapsed().as_secs_f64() * 1000.0, false);
        let sid = session.session_id.clone();
        drop(session);
        self.maybe_checkpoint(&sid).await?;
        Ok(updated)
    }

    /// Fetch one task, serving from cache when fresh. On a cache miss with
    /// per-task storage, re-reads the task's file from disk so a corrupted
    /// on-disk copy is caught and (if auto-repair is on) healed on read,
    /// rather than only ever served from the in-memory map.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        if let Some(task) = self.cache.get(id.as_str()) {
            let session_id = self.session.lock().await.session_id.clone();
            self.events.emit(Event::new(
                session_id,
                EventKind::TaskStateLoaded,
                json!({"task_id": id.to_string(), "source": "cache"}),
            ));
            return Ok(Some(task));
        }

        let in_memory = self.tasks.read().get(id).cloned();
        let task = match self.config.storage_layout {
            StorageLayout::PerTask => self.read_through_with_repair(id, in_memory).await?,
            StorageLayout::SingleFile => in_memory,
        };

        if let Some(task) = &task {
            self.cache.set(id.as_str().to_string(), task.clone());
            let session_id = self.session.lock().await.session_id.clone();
            self.events.emit(Event::new(
                session_id,
                EventKind::TaskStateLoaded,
                json!({"task_id": id.to_string(), "source": "disk"}),
            ));
        }
        Ok(task)
    }

    /// Read a task's file directly, running it through corruption
    /// detection and (if auto-repair is enabled) the repair registry
    /// before falling back to whatever was already in memory.
    async fn read_through_with_repair(
        &self,
        id: &TaskId,
        fallback: Option<Task>,
    ) -> Result<Option<Task>> {
        let path = self.config.task_file_path(id.as_str());
        let raw = match self
            .atomic_store
            .atomic_read(&path, ReadOptions { require_valid_json: false })
            .await
        {
            Ok(bytes) => bytes,
            Err(_) => return Ok(fallback),
        };

        let Some(report) = self.integrity.detect_corruption(&raw) else {
            return match serde_json::from_slice::<Task>(&raw) {
                Ok(task) => {
                    self.tasks.write().insert(id.clone(), task.clone());
                    Ok(Some(task))
                }
                Err(_) => Ok(fallback),
            };
        };

        let session_id = self.session.lock().await.session_id.clone();
        warn!(task_id = %id, kind = report.kind, "corruption detected on read");
        self.audit
            .append(
                "integrity_violation",
                json!({"task_id": id.to_string(), "kind": report.kind, "evidence": report.evidence}),
            )
            .await?;
        self.events.emit(Event::new(
            session_id.clone(),
            EventKind::Alert,
            json!({"task_id": id.to_string(), "kind": "integrity_violation", "detector": report.kind}),
        ));

        let snapshot = self.tasks.read().clone();
        let known = Self::known_task_ids_predicate(&snapshot);
        let Some(outcome) = self.integrity.repair(&raw, &report, &known) else {
            return Err(StoreError::CorruptionDetected(report.evidence));
        };
        let Some(repaired) = outcome.record else {
            return Err(StoreError::CorruptionDetected(report.evidence));
        };

        self.tasks.write().insert(id.clone(), repaired.clone());
        self.persist_single_task(&repaired).await?;
        self.audit
            .append(
                "repair_applied",
                json!({"task_id": id.to_string(), "confidence": outcome.confidence, "warnings": outcome.warnings}),
            )
            .await?;
        self.events.emit(Event::new(
            session_id,
            EventKind::Alert,
            json!({"task_id": id.to_string(), "kind": "repair_applied"}),
        ));
        Ok(Some(repaired))
    }

    /// Evict `id` from the read cache. The next `get(id)` re-reads from disk
    /// (and, for per-task storage, re-runs corruption detection).
    pub fn invalidate_cache(&self, id: &TaskId) {
        self.cache.invalidate(id.as_str());
    }

    /// Filter, sort, and paginate the task map.
    #[instrument(skip(self, filter, sort))]
    pub async fn list(&self, filter: &TaskFilter, sort: Sort, page: Page) -> Result<ListPage> {
        let snapshot = self.tasks.read();
        let total = snapshot.len();
        let mut items: Vec<Task> = snapshot
            .values()
            .filter(|t| {
                filter.status.is_none_or(|s| t.status == s)
                    && filter
                        .tag
                        .as_ref()
                        .is_none_or(|tag| t.tags.contains(tag))
                    && filter
                        .id_contains
                        .as_ref()
                        .is_none_or(|needle| t.id.as_str().contains(needle.as_str()))
                    && filter.since.is_none_or(|since| t.created_at >= since)
                    && filter.until.is_none_or(|until| t.created_at <= until)
            })
            .cloned()
            .collect();
        drop(snapshot);

        items.sort_by(|a, b| {
            let ord = match sort.field {
                SortField::Priority => a.priority.cmp(&b.priority),
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                SortField::Id => a.id.cmp(&b.id),
            };
            let ord = match sort.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            ord.then_with(|| a.id.cmp(&b.id))
        });

        let filtered = items.len();
        let limit = page.limit.max(1);
        let offset = page.page.saturating_sub(1) * limit;
        let page_items = items.into_iter().skip(offset).take(limit).collect();
        let page_count = filtered.div_ceil(limit).max(1);

        Ok(ListPage {
            items: page_items,
            total,
            filtered,
            page_count,
        })
    }

    /// Logically delete a task (tombstone via `status = cancelled`, retained
    /// in checkpoints until pruned).
    ///
    /// # Errors
    /// `NotFound` if `id` is absent.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &TaskId) -> Result<()> {
        let op_started = Instant::now();
        let existing = self
            .tasks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut session = self.session.lock().await;
        let session_id = session.session_id.clone();
        let mut tombstoned = existing.clone();
        tombstoned.status = TaskStatus::Cancelled;
        tombstoned.version += 1;
        tombstoned.updated_at = Utc::now();
        tombstoned.checksum = tombstoned.compute_checksum();

        self.tasks.write().insert(id.clone(), tombstoned.clone());
        self.persist_single_task(&tombstoned).await?;
        self.audit
            .append("task_deleted", json!({"task_id": id.to_string()}))
            .await?;
        self.cache.invalidate(id.as_str());
        self.events.emit(Event::new(
            session_id,
            EventKind::TaskStateSaved,
            json!({"task_id": id.to_string(), "op": "delete"}),
        ));
        session
            .statistics
            .record_operation(op_started.elapsed().as_secs_f64() * 1000.0, false);
        Ok(())
    }

    /// Copy primary files into a timestamped backup directory alongside a
    /// manifest of sizes and checksums.
    ///
    /// # Errors
    /// `PersistError` if a source file cannot be read or the backup cannot
    /// be written.
    #[instrument(skip(self))]
    pub async fn backup(&self, label: Option<String>) -> Result<BackupManifest> {
        let session_id = self.session.lock().await.session_id.clone();
        let label = label.unwrap_or_else(|| "manual".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let id = format!("{label}-{stamp}");
        let dir = self.config.backups_dir().join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::PersistError(source.to_string()))?;

        let mut files = Vec::new();
        let candidate_paths = [
            self.config.primary_file_path(),
            self.config.audit_log_path(),
        ];
        for path in candidate_paths {
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let checksum = crate::checksum::digest_str(&String::from_utf8_lossy(&bytes));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            tokio::fs::write(dir.join(&name), &bytes)
                .await
                .map_err(|source| StoreError::PersistError(source.to_string()))?;
            files.push(BackupFileEntry {
                name,
                size_bytes: bytes.len() as u64,
                checksum,
            });
        }

        let manifest = BackupManifest {
            id,
            label,
            created_at: Utc::now(),
            producing_session: session_id,
            files,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        tokio::fs::write(dir.join("manifest.json"), manifest_bytes)
            .await
            .map_err(|source| StoreError::PersistError(source.to_string()))?;
        info!(label = %manifest.label, "backup created");
        Ok(manifest)
    }

    /// Restore files from a backup directory, verifying manifest checksums
    /// and taking a pre-restore backup first.
    ///
    /// # Errors
    /// `NotFound` if the backup directory is missing; `IntegrityError` if a
    /// file's checksum doesn't match the manifest.
    #[instrument(skip(self))]
    pub async fn restore(&self, backup_id: &str) -> Result<RestoreReport> {
        let dir = self.config.backups_dir().join(backup_id);
        let manifest_bytes = tokio::fs::read(dir.join("manifest.json"))
            .await
            .map_err(|_| StoreError::NotFound(format!("backup {backup_id}")))?;
        let manifest: BackupManifest = serde_json::from_slice(&manifest_bytes)?;

        self.backup(Some(format!("pre-restore-{backup_id}")))
            .await?;

        let mut files_restored = 0;
        for entry in &manifest.files {
            let bytes = tokio::fs::read(dir.join(&entry.name))
                .await
                .map_err(|source| StoreError::PersistError(source.to_string()))?;
            let checksum = crate::checksum::digest_str(&String::from_utf8_lossy(&bytes));
            if checksum != entry.checksum {
                return Err(StoreError::IntegrityError(format!(
                    "backup file {} failed checksum verification",
                    entry.name
                )));
            }
            let target = self.config.persistence_directory.join(&entry.name);
            self.atomic_store.transaction(&target, &bytes).await?;
            files_restored += 1;
        }

        self.cache.clear();
        let reloaded = Self::load_from_disk(&self.atomic_store, &self.config).await?;
        let revalidated = {
            let snapshot = reloaded.clone();
            let known = Self::known_task_ids_predicate(&snapshot);
            snapshot
                .values()
                .all(|t| !self.integrity.blocks_commit(&self.integrity.validate(t, &known)))
        };
        *self.tasks.write() = reloaded;

        Ok(RestoreReport {
            label: backup_id.to_string(),
            files_restored,
            revalidated,
        })
    }

    /// Health summary: task counts by status, cache stats, last checkpoint,
    /// active session count, audit chain health.
    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<StoreStats> {
        let mut task_counts_by_status = HashMap::new();
        for task in self.tasks.read().values() {
            *task_counts_by_status
                .entry(format!("{:?}", task.status).to_lowercase())
                .or_insert(0usize) += 1;
        }
        let last_checkpoint = self
            .checkpoints
            .list()
            .await?
            .into_iter()
            .max_by_key(|c| c.timestamp);
        let active_sessions = self.sessions.active_sessions().await?.len();
        let audit_chain_ok = self.audit.verify_chain().await?.is_none();

        Ok(StoreStats {
            task_counts_by_status,
            cache: self.cache.stats(),
            last_checkpoint,
            active_sessions,
            audit_chain_ok,
        })
    }

    /// Terminate this process's session, optionally taking a final
    /// checkpoint.
    ///
    /// # Errors
    /// Propagates I/O failures from the final checkpoint or session write.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, graceful: bool) -> Result<()> {
        let mut session = self.session.lock().await;
        if graceful {
            let snapshot = self.tasks.read().clone();
            self.checkpoints
                .create(session.session_id.clone(), snapshot.clone(), CheckpointType::Manual)
                .await?;
            *self.last_checkpoint_snapshot.write() = Some(snapshot);
        }
        self.sessions.shutdown(&mut session, graceful).await?;
        self.events.emit(Event::new(
            session.session_id.clone(),
            EventKind::Shutdown,
            json!({"graceful": graceful}),
        ));
        Ok(())
    }

    /// Take an out-of-band emergency checkpoint, for callers reacting to an
    /// otherwise-uncaught fatal condition.
    ///
    /// # Errors
    /// Propagates checkpoint persistence failures.
    pub async fn emergency_checkpoint(&self) -> Result<()> {
        let session_id = self.session.lock().await.session_id.clone();
        let snapshot = self.tasks.read().clone();
        self.checkpoints
            .create(session_id.clone(), snapshot.clone(), CheckpointType::CrashRecovery)
            .await?;
        *self.last_checkpoint_snapshot.write() = Some(snapshot);
        self.events.emit(Event::new(
            session_id,
            EventKind::EmergencyCheckpoint,
            json!({}),
        ));
        Ok(())
    }

    /// Replay the audit log into a structured filter for external review.
    ///
    /// # Errors
    /// Propagates audit log read failures.
    pub async fn audit_query(&self, filter: &AuditFilter) -> Result<Vec<crate::audit::AuditEntry>> {
        Ok(self.audit.query(filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn open_store(dir: &std::path::Path) -> TaskStore {
        let config = StoreConfig {
            persistence_directory: dir.to_path_buf(),
            checkpoint_operation_threshold: 1000,
            ..Default::default()
        };
        TaskStore::open(config, Arc::new(EventBus::new())).await.unwrap()
    }

    fn draft(name: &str, priority: i64) -> TaskDraft {
        TaskDraft {
            name: name.to_string(),
            description: String::new(),
            task_type: "build".to_string(),
            priority,
            status: None,
            tags: HashSet::new(),
            dependencies: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let task = store.create(draft("T1", 5)).await.unwrap();
        assert_eq!(task.version, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        let fetched = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
    }

    #[tokio::test]
    async fn update_bumps_version_and_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let task = store.create(draft("T1", 5)).await.unwrap();
        let updated = store
            .update(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, TaskStatus::Running);
        assert!(updated.updated_at >= task.created_at);
        assert_eq!(updated.history_tail.len(), 1);
        assert_eq!(updated.history_tail[0].version, 1);
        assert_eq!(updated.history_tail[0].changed_fields, vec!["status"]);
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let result = store
            .update(&TaskId::from("task-missing"), TaskPatch::default())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_sorts_by_priority_descending_with_id_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        for (name, priority) in [("a", 3), ("b", 1), ("c", 4), ("d", 1), ("e", 5)] {
            store.create(draft(name, priority)).await.unwrap();
        }
        let page = store
            .list(
                &TaskFilter::default(),
                Sort {
                    field: SortField::Priority,
                    order: SortOrder::Desc,
                },
                Page { page: 1, limit: 10 },
            )
            .await
            .unwrap();
        let priorities: Vec<i64> = page.items.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![5, 4, 3, 1, 1]);
        let last_two_ids: Vec<&str> = page.items[3..5].iter().map(|t| t.id.as_str()).collect();
        assert!(last_two_ids[0] < last_two_ids[1]);
    }

    #[tokio::test]
    async fn dependency_on_unknown_task_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let mut d = draft("T1", 1);
        d.dependencies.insert(TaskId::from("task-nonexistent"));
        let result = store.create(d).await;
        assert!(matches!(result, Err(StoreError::ValidationError(_))));
    }

    #[tokio::test]
    async fn backup_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            persistence_directory: dir.path().to_path_buf(),
            storage_layout: StorageLayout::SingleFile,
            ..Default::default()
        };
        let store = TaskStore::open(config, Arc::new(EventBus::new())).await.unwrap();
        store.create(draft("T1", 5)).await.unwrap();
        let manifest = store.backup(Some("nightly".to_string())).await.unwrap();
        let report = store.restore(&manifest.id).await.unwrap();
        assert_eq!(report.files_restored, manifest.files.len());
        assert!(report.revalidated);
    }

    #[tokio::test]
    async fn stats_reports_task_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.create(draft("T1", 1)).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.task_counts_by_status.get("pending"), Some(&1));
        assert!(stats.audit_chain_ok);
    }
}
