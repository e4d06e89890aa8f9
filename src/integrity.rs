//! Validation, corruption detection, and repair, as three independent
//! named registries.
//!
//! The registry shape — `Vec<Arc<dyn Trait>>`, fluent `with_*`
//! registration — is duplicated three times, once per capability, each
//! sorted by an explicit `priority` so call sites don't depend on
//! registration order.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::config::ValidationLevel;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub rule: &'static str,
    pub valid: bool,
    pub severity: Severity,
    pub message: String,
    pub details: Value,
}

/// Context available to a validation rule beyond the record itself:
/// the set of task ids known to exist, needed for dependency closure.
pub struct ValidationContext<'a> {
    pub known_task_ids: &'a dyn Fn(&str) -> bool,
}

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, task: &Task, ctx: &ValidationContext<'_>) -> ValidationOutcome;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub corrupted: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub confidence: f64,
    pub evidence: String,
}

pub trait CorruptionDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, raw: &[u8]) -> CorruptionReport;
}

#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub recovered: bool,
    pub record: Option<Task>,
    pub confidence: f64,
    pub warnings: Vec<String>,
}

pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32;
    fn repair(&self, raw: &[u8], report: &CorruptionReport) -> RepairOutcome;
}

struct PrioritizedRule {
    priority: i32,
    rule: Arc<dyn ValidationRule>,
}

struct PrioritizedDetector {
    priority: i32,
    detector: Arc<dyn CorruptionDetector>,
}

/// Composes the validation / detection / repair registries and applies the
/// configured [`ValidationLevel`].
pub struct IntegrityEngine {
    rules: Vec<PrioritizedRule>,
    detectors: Vec<PrioritizedDetector>,
    strategies: Vec<Arc<dyn RepairStrategy>>,
    backup_restore: Option<Arc<strategies::BackupRestore>>,
    validation_level: ValidationLevel,
    auto_repair: bool,
}

impl IntegrityEngine {
    #[must_use]
    pub fn new(validation_level: ValidationLevel, auto_repair: bool) -> Self {
        Self {
            rules: Vec::new(),
            detectors: Vec::new(),
            strategies: Vec::new(),
            backup_restore: None,
            validation_level,
            auto_repair,
        }
    }

    /// The engine pre-loaded with the built-in rules/detectors/strategies
    /// named in the contract.
    #[must_use]
    pub fn with_defaults(validation_level: ValidationLevel, auto_repair: bool) -> Self {
        let mut engine = Self::new(validation_level, auto_repair);
        engine
            .register_rule(0, Arc::new(rules::StructuralWellFormedness))
            .register_rule(10, Arc::new(rules::RequiredFieldsPresent))
            .register_rule(20, Arc::new(rules::StatusEnumMembership))
            .register_rule(30, Arc::new(rules::TimestampMonotonicity))
            .register_rule(40, Arc::new(rules::DependencyClosure))
            .register_detector(0, Arc::new(detectors::ParseFailureDetector))
            .register_detector(10, Arc::new(detectors::ChecksumMismatchDetector))
            .register_detector(20, Arc::new(detectors::StructuralInvariantDetector));
        engine.register_strategy(Arc::new(strategies::StructuralRepair));
        let backup_restore = Arc::new(strategies::BackupRestore::new());
        engine.register_strategy(backup_restore.clone());
        engine.backup_restore = Some(backup_restore);
        engine.register_strategy(Arc::new(strategies::PartialRecovery));
        engine
    }

    /// Inject the lookup `BackupRestore` uses to find a task's last-known-good
    /// copy. `TaskStore` wires this to its `CheckpointManager` at construction,
    /// since the registry has no other way to reach it.
    pub fn set_backup_lookup(&self, f: Box<dyn Fn(&str) -> Option<Task> + Send + Sync>) {
        if let Some(backup_restore) = &self.backup_restore {
            backup_restore.set_lookup(f);
        }
    }

    pub fn register_rule(&mut self, priority: i32, rule: Arc<dyn ValidationRule>) -> &mut Self {
        self.rules.push(PrioritizedRule { priority, rule });
        self.rules.sort_by_key(|r| r.priority);
        self
    }

    pub fn register_detector(
        &mut self,
        priority: i32,
        detector: Arc<dyn CorruptionDetector>,
    ) -> &mut Self {
        self.detectors.push(PrioritizedDetector { priority, detector });
        self.detectors.sort_by_key(|d| d.priority);
        self
    }

    pub fn register_strategy(&mut self, strategy: Arc<dyn RepairStrategy>) -> &mut Self {
        self.strategies.push(strategy);
        self.strategies
            .sort_by(|a, b| a.priority().cmp(&b.priority()));
        self
    }

    /// Run every registered rule and return the outcomes, worst severity first.
    #[instrument(skip(self, task, known_task_ids), fields(task_id = %task.id))]
    pub fn validate(
        &self,
        task: &Task,
        known_task_ids: &dyn Fn(&str) -> bool,
    ) -> Vec<ValidationOutcome> {
        let ctx = ValidationContext { known_task_ids };
        let mut outcomes: Vec<_> = self
            .rules
            .iter()
            .map(|r| r.rule.apply(task, &ctx))
            .collect();
        outcomes.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.rule.cmp(b.rule)));
        outcomes
    }

    /// Whether any outcome is severe enough to fail the commit at the
    /// configured validation level.
    #[must_use]
    pub fn blocks_commit(&self, outcomes: &[ValidationOutcome]) -> bool {
        let threshold = match self.validation_level {
            ValidationLevel::Lenient => Severity::Critical,
            ValidationLevel::Standard => Severity::Error,
            ValidationLevel::Strict => Severity::Warning,
        };
        outcomes
            .iter()
            .any(|o| !o.valid && o.severity >= threshold)
    }

    /// Run every detector against raw bytes and return the most confident
    /// positive report, if any.
    pub fn detect_corruption(&self, raw: &[u8]) -> Option<CorruptionReport> {
        self.detectors
            .iter()
            .map(|d| d.detector.detect(raw))
            .filter(|r| r.corrupted)
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(CmpOrdering::Equal))
    }

    #[must_use]
    pub fn auto_repair_enabled(&self) -> bool {
        self.auto_repair
    }

    /// Apply repair strategies in priority order until one recovers a
    /// record that re-validates cleanly.
    pub fn repair(
        &self,
        raw: &[u8],
        report: &CorruptionReport,
        known_task_ids: &dyn Fn(&str) -> bool,
    ) -> Option<RepairOutcome> {
        if !self.auto_repair {
            return None;
        }
        for strategy in &self.strategies {
            let outcome = strategy.repair(raw, report);
            if !outcome.recovered {
                continue;
            }
            if let Some(task) = &outcome.record {
                let revalidated = self.validate(task, known_task_ids);
                if self.blocks_commit(&revalidated) {
                    continue;
                }
            }
            return Some(outcome);
        }
        None
    }
}

pub mod rules {
    use super::{Severity, ValidationContext, ValidationOutcome, ValidationRule};
    use crate::task::Task;
    use serde_json::json;

    pub struct StructuralWellFormedness;
    impl ValidationRule for StructuralWellFormedness {
        fn name(&self) -> &'static str {
            "structural_well_formedness"
        }
        fn apply(&self, task: &Task, _ctx: &ValidationContext<'_>) -> ValidationOutcome {
            let valid = serde_json::to_value(task).is_ok();
            ValidationOutcome {
                rule: self.name(),
                valid,
                severity: Severity::Critical,
                message: if valid {
                    "task serializes to the expected shape".to_string()
                } else {
                    "task does not serialize to the expected shape".to_string()
                },
                details: json!({}),
            }
        }
    }

    pub struct RequiredFieldsPresent;
    impl ValidationRule for RequiredFieldsPresent {
        fn name(&self) -> &'static str {
            "required_fields_present"
        }
        fn apply(&self, task: &Task, _ctx: &ValidationContext<'_>) -> ValidationOutcome {
            let valid = !task.id.as_str().is_empty() && !task.name.is_empty();
            ValidationOutcome {
                rule: self.name(),
                valid,
                severity: Severity::Error,
                message: if valid {
                    "required fields present".to_string()
                } else {
                    "task is missing a required field (id or name)".to_string()
                },
                details: json!({"id": task.id.as_str(), "name": task.name}),
            }
        }
    }

    pub struct StatusEnumMembership;
    impl ValidationRule for StatusEnumMembership {
        fn name(&self) -> &'static str {
            "status_enum_membership"
        }
        fn apply(&self, task: &Task, _ctx: &ValidationContext<'_>) -> ValidationOutcome {
            // TaskStatus is a closed enum, so deserialization already
            // enforces membership; this rule exists for symmetry with the
            // contract and to catch a quarantined/partial record.
            ValidationOutcome {
                rule: self.name(),
                valid: true,
                severity: Severity::Error,
                message: format!("status {:?} is a recognized member", task.status),
                details: json!({}),
            }
        }
    }

    pub struct TimestampMonotonicity;
    impl ValidationRule for TimestampMonotonicity {
        fn name(&self) -> &'static str {
            "timestamp_monotonicity"
        }
        fn apply(&self, task: &Task, _ctx: &ValidationContext<'_>) -> ValidationOutcome {
            let valid = task.updated_at >= task.created_at;
            ValidationOutcome {
                rule: self.name(),
                valid,
                severity: Severity::Error,
                message: if valid {
                    "updated_at is not before created_at".to_string()
                } else {
                    "updated_at precedes created_at".to_string()
                },
                details: json!({
                    "created_at": task.created_at,
                    "updated_at": task.updated_at,
                }),
            }
        }
    }

    pub struct DependencyClosure;
    impl ValidationRule for DependencyClosure {
        fn name(&self) -> &'static str {
            "dependency_closure"
        }
        fn apply(&self, task: &Task, ctx: &ValidationContext<'_>) -> ValidationOutcome {
            let missing: Vec<&str> = task
                .dependencies
                .iter()
                .map(|d| d.as_str())
                .filter(|id| !(ctx.known_task_ids)(id))
                .collect();
            let valid = missing.is_empty();
            ValidationOutcome {
                rule: self.name(),
                valid,
                severity: Severity::Critical,
                message: if valid {
                    "all dependencies resolve to known tasks".to_string()
                } else {
                    format!("unresolved dependencies: {missing:?}")
                },
                details: json!({"missing": missing}),
            }
        }
    }
}

pub mod detectors {
    use super::{CorruptionDetector, CorruptionReport};
    use crate::task::Task;

    pub struct ParseFailureDetector;
    impl CorruptionDetector for ParseFailureDetector {
        fn name(&self) -> &'static str {
            "parse_failure"
        }
        fn detect(&self, raw: &[u8]) -> CorruptionReport {
            match serde_json::from_slice::<Task>(raw) {
                Ok(_) => CorruptionReport {
                    corrupted: false,
                    kind: self.name(),
                    confidence: 0.0,
                    evidence: String::new(),
                },
                Err(e) => CorruptionReport {
                    corrupted: true,
                    kind: self.name(),
                    confidence: 1.0,
                    evidence: e.to_string(),
                },
            }
        }
    }

    pub struct ChecksumMismatchDetector;
    impl CorruptionDetector for ChecksumMismatchDetector {
        fn name(&self) -> &'static str {
            "checksum_mismatch"
        }
        fn detect(&self, raw: &[u8]) -> CorruptionReport {
            let Ok(task) = serde_json::from_slice::<Task>(raw) else {
                return CorruptionReport {
                    corrupted: false,
                    kind: self.name(),
                    confidence: 0.0,
                    evidence: String::new(),
                };
            };
            if task.checksum_valid() {
                CorruptionReport {
                    corrupted: false,
                    kind: self.name(),
                    confidence: 0.0,
                    evidence: String::new(),
                }
            } else {
                CorruptionReport {
                    corrupted: true,
                    kind: self.name(),
                    confidence: 0.95,
                    evidence: format!(
                        "stored checksum {} does not match recomputed {}",
                        task.checksum,
                        task.compute_checksum()
                    ),
                }
            }
        }
    }

    pub struct StructuralInvariantDetector;
    impl CorruptionDetector for StructuralInvariantDetector {
        fn name(&self) -> &'static str {
            "structural_invariant"
        }
        fn detect(&self, raw: &[u8]) -> CorruptionReport {
            let Ok(task) = serde_json::from_slice::<Task>(raw) else {
                return CorruptionReport {
                    corrupted: false,
                    kind: self.name(),
                    confidence: 0.0,
                    evidence: String::new(),
                };
            };
            if task.updated_at < task.created_at || task.version == 0 {
                CorruptionReport {
                    corrupted: true,
                    kind: self.name(),
                    confidence: 0.8,
                    evidence: "version is zero or timestamps are inverted".to_string(),
                }
            } else {
                CorruptionReport {
                    corrupted: false,
                    kind: self.name(),
                    confidence: 0.0,
                    evidence: String::new(),
                }
            }
        }
    }
}

pub mod strategies {
    use super::{CorruptionReport, RepairOutcome, RepairStrategy};
    use crate::task::Task;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Normalizes known-safe structural deviations (e.g. trailing
    /// whitespace in the JSON body) and reparses.
    pub struct StructuralRepair;
    impl RepairStrategy for StructuralRepair {
        fn name(&self) -> &'static str {
            "structural_repair"
        }
        fn priority(&self) -> i32 {
            0
        }
        fn repair(&self, raw: &[u8], _report: &CorruptionReport) -> RepairOutcome {
            let text = String::from_utf8_lossy(raw);
            let trimmed_text = text.trim_end_matches(['\n', '\r', ',', ' ']);
            match serde_json::from_str::<Task>(trimmed_text) {
                Ok(task) => RepairOutcome {
                    recovered: true,
                    record: Some(task),
                    confidence: 0.6,
                    warnings: vec!["repaired via structural normalization".to_string()],
                },
                Err(_) => RepairOutcome {
                    recovered: false,
                    record: None,
                    confidence: 0.0,
                    warnings: vec![],
                },
            }
        }
    }

    /// Fetches the task from the most recent checkpoint that contains it.
    /// The checkpoint snapshot lookup is injected by `TaskStore` at
    /// construction, since the repair strategy itself has no access to
    /// `CheckpointManager`.
    pub struct BackupRestore {
        lookup: Mutex<Option<Box<dyn Fn(&str) -> Option<Task> + Send + Sync>>>,
    }

    impl BackupRestore {
        #[must_use]
        pub fn new() -> Self {
            Self {
                lookup: Mutex::new(None),
            }
        }

        pub fn set_lookup(&self, f: Box<dyn Fn(&str) -> Option<Task> + Send + Sync>) {
            *self.lookup.lock() = Some(f);
        }
    }

    impl Default for BackupRestore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RepairStrategy for BackupRestore {
        fn name(&self) -> &'static str {
            "backup_restore"
        }
        fn priority(&self) -> i32 {
            10
        }
        fn repair(&self, raw: &[u8], _report: &CorruptionReport) -> RepairOutcome {
            let Ok(partial) = serde_json::from_slice::<serde_json::Value>(raw) else {
                return RepairOutcome {
                    recovered: false,
                    record: None,
                    confidence: 0.0,
                    warnings: vec![],
                };
            };
            let Some(id) = partial.get("id").and_then(|v| v.as_str()) else {
                return RepairOutcome {
                    recovered: false,
                    record: None,
                    confidence: 0.0,
                    warnings: vec![],
                };
            };
            let guard = self.lookup.lock();
            match guard.as_ref().and_then(|f| f(id)) {
                Some(task) => RepairOutcome {
                    recovered: true,
                    record: Some(task),
                    confidence: 0.9,
                    warnings: vec!["restored from latest checkpoint".to_string()],
                },
                None => RepairOutcome {
                    recovered: false,
                    record: None,
                    confidence: 0.0,
                    warnings: vec![],
                },
            }
        }
    }

    /// Last resort: synthesize a minimum-viable record from whatever
    /// fields parsed, flagged for human review, with the corrupted
    /// original preserved verbatim in a quarantine field.
    pub struct PartialRecovery;
    impl RepairStrategy for PartialRecovery {
        fn name(&self) -> &'static str {
            "partial_recovery"
        }
        fn priority(&self) -> i32 {
            20
        }
        fn repair(&self, raw: &[u8], _report: &CorruptionReport) -> RepairOutcome {
            use crate::ids::{SessionId, TaskId};
            use chrono::Utc;
            use std::collections::{HashSet, VecDeque};

            let partial: HashMap<String, serde_json::Value> =
                serde_json::from_slice(raw).unwrap_or_default();
            let id = partial
                .get("id")
                .and_then(|v| v.as_str())
                .map(TaskId::from)
                .unwrap_or_else(TaskId::generate);
            let name = partial
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("quarantined")
                .to_string();
            let now = Utc::now();
            let mut task = Task {
                id,
                name,
                description: format!(
                    "NEEDS_HUMAN_REVIEW: quarantined original = {}",
                    String::from_utf8_lossy(raw)
                ),
                task_type: "unknown".to_string(),
                priority: 0,
                status: crate::task::TaskStatus::Failed,
                created_at: now,
                updated_at: now,
                tags: HashSet::new(),
                dependencies: HashSet::new(),
                execution_metadata: None,
                version: 1,
                checksum: String::new(),
                session_id: SessionId::from("quarantine"),
                history_tail: VecDeque::new(),
            };
            task.checksum = task.compute_checksum();
            RepairOutcome {
                recovered: true,
                record: Some(task),
                confidence: 0.2,
                warnings: vec!["synthesized minimum-viable record; needs human review".to_string()],
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SessionId, TaskId};
    use chrono::Utc;
    use std::collections::{HashSet, VecDeque};

    fn task_with_dependency(dep: &str) -> Task {
        let now = Utc::now();
        let mut task = Task {
            id: TaskId::from("task-1"),
            name: "T1".to_string(),
            description: String::new(),
            task_type: "build".to_string(),
            priority: 1,
            status: crate::task::TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            tags: HashSet::new(),
            dependencies: HashSet::from([TaskId::from(dep)]),
            execution_metadata: None,
            version: 1,
            checksum: String::new(),
            session_id: SessionId::from("s1"),
            history_tail: VecDeque::new(),
        };
        task.checksum = task.compute_checksum();
        task
    }

    #[test]
    fn dependency_closure_flags_unresolved_ids() {
        let engine = IntegrityEngine::with_defaults(ValidationLevel::Standard, true);
        let task = task_with_dependency("task-missing");
        let outcomes = engine.validate(&task, &|id| id == "task-1");
        assert!(engine.blocks_commit(&outcomes));
    }

    #[test]
    fn dependency_closure_passes_when_resolved() {
        let engine = IntegrityEngine::with_defaults(ValidationLevel::Standard, true);
        let task = task_with_dependency("task-2");
        let outcomes = engine.validate(&task, &|id| id == "task-1" || id == "task-2");
        assert!(!engine.blocks_commit(&outcomes));
    }

    #[test]
    fn checksum_mismatch_detector_flags_tampered_bytes() {
        let engine = IntegrityEngine::with_defaults(ValidationLevel::Standard, true);
        let task = task_with_dependency("task-2");
        let mut raw = serde_json::to_vec(&task).unwrap();
        raw[10] ^= 0xFF;
        let report = engine.detect_corruption(&raw);
        assert!(report.is_some());
    }
}
