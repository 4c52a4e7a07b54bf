//! Wire types mirroring the coordinator's HTTP responses (§6.1). Kept in
//! lockstep with `bespoke_orchestration::http`'s DTOs, but owned separately
//! since the client must not depend on the coordinator crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct CreateSubmissionsRequest {
    pub workflows: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedSubmission {
    pub id: u64,
    #[serde(rename = "self")]
    pub self_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubmissionsResponse {
    pub submissions: Vec<CreatedSubmission>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskView {
    pub id: Uuid,
    pub fingerprint: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageView {
    pub name: String,
    pub status: String,
    pub tasks: Vec<TaskView>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionView {
    pub id: u64,
    pub status: String,
    pub stages: Vec<StageView>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SubmissionView {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "success" | "errored" | "cancelled")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse {
    pub items: Vec<SubmissionView>,
    pub next: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub version: String,
    pub store_connected: bool,
    pub worker_pools: WorkerPoolSizes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerPoolSizes {
    pub fragment: usize,
    pub qc: usize,
    pub optimize: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatusFilter {
    Waiting,
    Running,
    Success,
    Errored,
    Cancelled,
}

impl SubmissionStatusFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }
}
