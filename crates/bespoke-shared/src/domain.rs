//! # Data Model (§3)
//!
//! Submission, Stage Record, Task Record, Cache Entry, Lease, and Queue
//! Item, plus closed enums in place of a class hierarchy (tagged variants
//! carrying kind, spec, and extras).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the three stage kinds a workflow document declares, in order.
/// A closed enum, not a general workflow DSL (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Fragmentation,
    QcGeneration,
    Optimization,
}

impl StageKind {
    /// The three stages always run in this fixed order (§3, §4.2).
    pub const ORDER: [StageKind; 3] = [
        StageKind::Fragmentation,
        StageKind::QcGeneration,
        StageKind::Optimization,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Fragmentation => "fragmentation",
            StageKind::QcGeneration => "qc-generation",
            StageKind::Optimization => "optimization",
        }
    }

    pub fn routing_key(self) -> RoutingKey {
        match self {
            StageKind::Fragmentation => RoutingKey::Fragment,
            StageKind::QcGeneration => RoutingKey::Qc,
            StageKind::Optimization => RoutingKey::Optimize,
        }
    }

    pub fn ordinal(self) -> usize {
        Self::ORDER.iter().position(|s| *s == self).unwrap()
    }

    pub fn next(self) -> Option<StageKind> {
        Self::ORDER.get(self.ordinal() + 1).copied()
    }
}

/// Label used by the Task Queue to deliver only compatible tasks to a
/// worker pool (§3 "Queue Item", glossary "Routing key").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingKey {
    Fragment,
    Qc,
    Optimize,
}

impl RoutingKey {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingKey::Fragment => "fragment",
            RoutingKey::Qc => "qc",
            RoutingKey::Optimize => "optimize",
        }
    }

    pub const ALL: [RoutingKey; 3] = [RoutingKey::Fragment, RoutingKey::Qc, RoutingKey::Optimize];
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Waiting,
    Running,
    Success,
    Errored,
    Cancelled,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubmissionStatus::Success | SubmissionStatus::Errored | SubmissionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Errored,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Success | StageStatus::Errored | StageStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Cached,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cached
        )
    }
}

/// A single unit of work handed to a worker (§3 "Task Record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub fingerprint: String,
    pub routing_key: RoutingKey,
    pub input: serde_json::Value,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
    pub status: TaskStatus,
}

impl TaskRecord {
    pub fn new(fingerprint: String, routing_key: RoutingKey, input: serde_json::Value) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            fingerprint,
            routing_key,
            input,
            attempt_count: 0,
            last_error: None,
            result_ref: None,
            status: TaskStatus::Pending,
        }
    }
}

/// One ordered step of a workflow (§3 "Stage Record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub kind: StageKind,
    pub status: StageStatus,
    pub tasks: Vec<TaskRecord>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl StageRecord {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            status: StageStatus::Pending,
            tasks: Vec::new(),
            output: None,
            error: None,
        }
    }
}

/// A bespoke fitting submission (§3 "Submission").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    /// Client-visible, monotonically assigned identifier (§3).
    pub id: u64,
    /// Internal correlation id threaded through queue messages.
    pub uuid: Uuid,
    pub workflow: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: SubmissionStatus,
    pub stages: Vec<StageRecord>,
    /// Set when `status` becomes `errored`, naming the first failing stage
    /// (§7 "Stage-level errors surface to the submission as errored with a
    /// pointer to the first failing stage").
    pub error: Option<String>,
}

impl Submission {
    pub fn new(id: u64, workflow: serde_json::Value) -> Self {
        Self {
            id,
            uuid: Uuid::now_v7(),
            workflow,
            created_at: Utc::now(),
            status: SubmissionStatus::Waiting,
            stages: StageKind::ORDER.iter().map(|k| StageRecord::new(*k)).collect(),
            error: None,
        }
    }

    /// The earliest stage whose status is not yet terminal, if any (§4.2 step 1).
    pub fn current_stage_mut(&mut self) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| !s.status.is_terminal())
    }

    pub fn current_stage(&self) -> Option<&StageRecord> {
        self.stages.iter().find(|s| !s.status.is_terminal())
    }
}

/// A deduplicated cache entry (§3 "Cache Entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub value: serde_json::Value,
    pub produced_by: String,
    pub finished_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// A time-bounded exclusive claim on a fingerprint (§3 "Lease").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub fingerprint: String,
    pub owner: Uuid,
    pub deadline: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_order_is_fixed() {
        assert_eq!(StageKind::Fragmentation.next(), Some(StageKind::QcGeneration));
        assert_eq!(StageKind::QcGeneration.next(), Some(StageKind::Optimization));
        assert_eq!(StageKind::Optimization.next(), None);
    }

    #[test]
    fn stage_routing_keys_are_distinct() {
        assert_eq!(StageKind::Fragmentation.routing_key(), RoutingKey::Fragment);
        assert_eq!(StageKind::QcGeneration.routing_key(), RoutingKey::Qc);
        assert_eq!(StageKind::Optimization.routing_key(), RoutingKey::Optimize);
    }

    #[test]
    fn new_submission_has_three_pending_stages() {
        let sub = Submission::new(1, json!({"smiles": "CC"}));
        assert_eq!(sub.stages.len(), 3);
        assert!(sub.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert_eq!(sub.status, SubmissionStatus::Waiting);
    }

    #[test]
    fn current_stage_is_first_non_terminal() {
        let mut sub = Submission::new(1, json!({}));
        sub.stages[0].status = StageStatus::Success;
        let current = sub.current_stage().unwrap();
        assert_eq!(current.kind, StageKind::QcGeneration);
    }

    #[test]
    fn terminal_statuses_are_sticky_by_construction() {
        assert!(SubmissionStatus::Success.is_terminal());
        assert!(SubmissionStatus::Errored.is_terminal());
        assert!(SubmissionStatus::Cancelled.is_terminal());
        assert!(!SubmissionStatus::Waiting.is_terminal());
        assert!(!SubmissionStatus::Running.is_terminal());
    }
}
