//! # taskvault: durable, crash-tolerant task-state store
//!
//! taskvault keeps a map of [`task::Task`] records coherent across process
//! restarts and crashes. Every mutation lands on disk through
//! [`atomic_store::AtomicStore`] before it is visible to readers, every
//! mutation is recorded in a hash-chained [`audit::AuditLog`], and periodic
//! [`checkpoint::Checkpoint`]s let a new process resume a crashed one's
//! work without replaying history from scratch.
//!
//! ## Core Concepts
//!
//! - **Task**: the unit of durable state — versioned, checksummed, with a
//!   bounded mutation history.
//! - **AtomicStore**: write-temp-then-rename persistence plus advisory
//!   cross-process file locking.
//! - **IntegrityEngine**: pluggable validation rules, corruption detectors,
//!   and repair strategies.
//! - **AuditLog**: an append-only, hash-chained record of every mutation.
//! - **CheckpointManager**: periodic snapshots of the task map, pruned to a
//!   retention cap.
//! - **SessionManager**: registers this process, emits heartbeats, and
//!   reclassifies abandoned sessions as crashed at startup.
//! - **TaskStore**: the public façade composing all of the above.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::collections::HashSet;
//! use std::sync::Arc;
//!
//! use taskvault::config::StoreConfig;
//! use taskvault::events::EventBus;
//! use taskvault::store::TaskStore;
//! use taskvault::task::TaskDraft;
//!
//! # async fn run() -> taskvault::error::Result<()> {
//! let store = TaskStore::open(StoreConfig::default(), Arc::new(EventBus::new())).await?;
//!
//! let task = store
//!     .create(TaskDraft {
//!         name: "build release artifact".to_string(),
//!         description: String::new(),
//!         task_type: "build".to_string(),
//!         priority: 5,
//!         status: None,
//!         tags: HashSet::new(),
//!         dependencies: HashSet::new(),
//!     })
//!     .await?;
//!
//! assert_eq!(task.version, 1);
//! store.shutdown(true).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`ids`] — typed identifiers for every record kind
//! - [`checksum`] — canonical JSON encoding and content hashing
//! - [`config`] — `StoreConfig` and its defaults
//! - [`events`] — `EventSink`/`EventBus` publish-subscribe
//! - [`task`] — the `Task` record and its draft/patch/history satellites
//! - [`atomic_store`] — write-temp-then-rename persistence and file locking
//! - [`integrity`] — validation rules, corruption detectors, repair strategies
//! - [`audit`] — the hash-chained audit trail
//! - [`cache`] — the bounded read-through cache
//! - [`checkpoint`] — checkpoint snapshots and their storage backends
//! - [`session`] — process-session registration and crash detection
//! - [`error`] — the unified `StoreError` taxonomy
//! - [`store`] — `TaskStore`, the public façade

pub mod atomic_store;
pub mod audit;
pub mod cache;
pub mod checkpoint;
pub mod checksum;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod integrity;
pub mod session;
pub mod store;
pub mod task;
