//! The `Task` record and its draft/patch/history satellite types.
//!
//! `result_blob` is modeled as an opaque byte string with a content-type
//! tag rather than a dynamically typed map.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::ids::{SessionId, TaskId};

pub const MAX_HISTORY_ENTRIES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// An opaque, free-form execution result: bytes plus a content-type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultBlob {
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl ResultBlob {
    #[must_use]
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }

    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text/plain", text.into().into_bytes())
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecutionMetadata {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result_blob: Option<ResultBlob>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub changed_fields: Vec<String>,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tags: HashSet<String>,
    pub dependencies: HashSet<TaskId>,
    pub execution_metadata: Option<ExecutionMetadata>,
    pub version: u64,
    pub checksum: String,
    pub session_id: SessionId,
    pub history_tail: VecDeque<HistoryEntry>,
}

impl Task {
    /// Recompute the content checksum over every field except `checksum`
    /// itself, using the crate's canonical-JSON + blake3 digest.
    ///
    /// # Panics
    /// Never in practice: `Task` is always representable as JSON.
    #[must_use]
    pub fn compute_checksum(&self) -> String {
        let mut value = serde_json::to_value(self).expect("Task always serializes");
        if let Some(obj) = value.as_object_mut() {
            obj.remove("checksum");
        }
        let canonical = checksum::canonicalize(&value);
        checksum::digest_str(&serde_json::to_string(&canonical).expect("value always serializes"))
    }

    /// `true` if the stored checksum matches a fresh recomputation.
    #[must_use]
    pub fn checksum_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Push a history entry, evicting the oldest once the bound is exceeded.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history_tail.push_back(entry);
        while self.history_tail.len() > MAX_HISTORY_ENTRIES {
            self.history_tail.pop_front();
        }
    }
}

/// Input to `TaskStore::create`: everything a caller supplies before the
/// store assigns an id, version, and checksum.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub dependencies: HashSet<TaskId>,
}

/// A partial update applied to an existing task by `TaskStore::update`.
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub status: Option<TaskStatus>,
    pub tags: Option<HashSet<String>>,
    pub dependencies: Option<HashSet<TaskId>>,
    pub execution_metadata: Option<ExecutionMetadata>,
}

impl TaskPatch {
    /// Names of the fields this patch actually sets, for `history_tail`.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        if self.name.is_some() {
            fields.push("name".to_string());
        }
        if self.description.is_some() {
            fields.push("description".to_string());
        }
        if self.priority.is_some() {
            fields.push("priority".to_string());
        }
        if self.status.is_some() {
            fields.push("status".to_string());
        }
        if self.tags.is_some() {
            fields.push("tags".to_string());
        }
        if self.dependencies.is_some() {
            fields.push("dependencies".to_string());
        }
        if self.execution_metadata.is_some() {
            fields.push("execution_metadata".to_string());
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        let mut task = Task {
            id: TaskId::from("task-1"),
            name: "T1".to_string(),
            description: String::new(),
            task_type: "build".to_string(),
            priority: 5,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tags: HashSet::new(),
            dependencies: HashSet::new(),
            execution_metadata: None,
            version: 1,
            checksum: String::new(),
            session_id: SessionId::from("session-1"),
            history_tail: VecDeque::new(),
        };
        task.checksum = task.compute_checksum();
        task
    }

    #[test]
    fn checksum_round_trips() {
        let task = sample_task();
        assert!(task.checksum_valid());
    }

    #[test]
    fn mutating_a_field_invalidates_checksum() {
        let mut task = sample_task();
        task.priority = 9;
        assert!(!task.checksum_valid());
    }

    #[test]
    fn history_tail_is_bounded() {
        let mut task = sample_task();
        for v in 0..(MAX_HISTORY_ENTRIES as u64 + 5) {
            task.push_history(HistoryEntry {
                version: v,
                timestamp: Utc::now(),
                changed_fields: vec!["status".to_string()],
                session_id: SessionId::from("session-1"),
            });
        }
        assert_eq!(task.history_tail.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(task.history_tail.front().unwrap().version, 5);
    }

    #[test]
    fn result_blob_base64_round_trips() {
        let blob = ResultBlob::new("application/octet-stream", vec![0, 1, 2, 255, 254]);
        let json = serde_json::to_string(&blob).unwrap();
        let back: ResultBlob = serde_json::from_str(&json).unwrap();
        assert_eq!(blob, back);
    }
}
