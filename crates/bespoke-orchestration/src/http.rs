//! HTTP surface (§6.1), built on `axum` with `tower-http` tracing and
//! timeout layers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bespoke_shared::domain::{Submission, SubmissionStatus};
use bespoke_shared::error::ExecutorError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::{CancelOutcome, Coordinator};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/submissions", post(create_submissions).get(list_submissions))
        .route("/submissions/{id}", get(get_submission).delete(cancel_submission))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(coordinator)
}

/// Maps `ExecutorError` to an HTTP response that never leaks internal
/// detail (§7 "HTTP responses ... never a process-internal exception
/// trace").
struct ApiError(ExecutorError);

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "invalid-schema" => StatusCode::BAD_REQUEST,
            "not-found" => StatusCode::NOT_FOUND,
            "queue-unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            "worker-crashed" | "executor-error" => StatusCode::BAD_GATEWAY,
            "cancelled" => StatusCode::CONFLICT,
            "timeout" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.kind(), "message": self.0.public_message()}))).into_response()
    }
}

#[derive(Deserialize)]
struct CreateSubmissionsRequest {
    workflows: Vec<Value>,
}

#[derive(Serialize)]
struct CreatedSubmission {
    id: u64,
    #[serde(rename = "self")]
    self_url: String,
}

#[derive(Serialize)]
struct CreateSubmissionsResponse {
    submissions: Vec<CreatedSubmission>,
}

async fn create_submissions(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<CreateSubmissionsRequest>,
) -> Result<Json<CreateSubmissionsResponse>, ApiError> {
    let mut submissions = Vec::with_capacity(body.workflows.len());
    for workflow in body.workflows {
        let submission = coordinator.submit(workflow).await?;
        submissions.push(CreatedSubmission {
            id: submission.id,
            self_url: format!("/submissions/{}", submission.id),
        });
    }
    Ok(Json(CreateSubmissionsResponse { submissions }))
}

#[derive(Serialize)]
struct TaskView {
    id: uuid::Uuid,
    fingerprint: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct StageView {
    name: &'static str,
    status: &'static str,
    tasks: Vec<TaskView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct SubmissionView {
    id: u64,
    status: &'static str,
    stages: Vec<StageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn status_str(status: SubmissionStatus) -> &'static str {
    match status {
        SubmissionStatus::Waiting => "waiting",
        SubmissionStatus::Running => "running",
        SubmissionStatus::Success => "success",
        SubmissionStatus::Errored => "errored",
        SubmissionStatus::Cancelled => "cancelled",
    }
}

fn stage_status_str(status: bespoke_shared::domain::StageStatus) -> &'static str {
    use bespoke_shared::domain::StageStatus::*;
    match status {
        Pending => "pending",
        Running => "running",
        Success => "success",
        Errored => "errored",
        Skipped => "skipped",
    }
}

fn task_status_str(status: bespoke_shared::domain::TaskStatus) -> &'static str {
    use bespoke_shared::domain::TaskStatus::*;
    match status {
        Pending => "pending",
        InFlight => "in-flight",
        Succeeded => "succeeded",
        Failed => "failed",
        Cached => "cached",
    }
}

/// Projects the persisted domain `Submission` into the wire shape §6.1
/// names: `{id, status, stages: [...], result?, error?}`.
fn view(submission: &Submission) -> SubmissionView {
    let stages = submission
        .stages
        .iter()
        .map(|stage| StageView {
            name: stage.kind.name(),
            status: stage_status_str(stage.status),
            tasks: stage
                .tasks
                .iter()
                .map(|task| TaskView {
                    id: task.task_id,
                    fingerprint: task.fingerprint.clone(),
                    status: task_status_str(task.status),
                    error: task.last_error.clone(),
                })
                .collect(),
            result: stage.output.clone(),
            error: stage.error.clone(),
        })
        .collect();
    let result = submission
        .stages
        .last()
        .filter(|_| submission.status == SubmissionStatus::Success)
        .and_then(|s| s.output.clone());
    SubmissionView {
        id: submission.id,
        status: status_str(submission.status),
        stages,
        result,
        error: submission.error.clone(),
    }
}

async fn get_submission(State(coordinator): State<Arc<Coordinator>>, Path(id): Path<u64>) -> Result<Json<SubmissionView>, ApiError> {
    let submission = coordinator.get(id).await?;
    Ok(Json(view(&submission)))
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    cursor: Option<u64>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ListResponse {
    items: Vec<SubmissionView>,
    next: Option<u64>,
}

fn parse_status(raw: &str) -> Result<SubmissionStatus, ApiError> {
    match raw {
        "waiting" => Ok(SubmissionStatus::Waiting),
        "running" => Ok(SubmissionStatus::Running),
        "success" => Ok(SubmissionStatus::Success),
        "errored" => Ok(SubmissionStatus::Errored),
        "cancelled" => Ok(SubmissionStatus::Cancelled),
        other => Err(ApiError(ExecutorError::InvalidSchema(format!("unknown status filter '{other}'")))),
    }
}

async fn list_submissions(State(coordinator): State<Arc<Coordinator>>, Query(query): Query<ListQuery>) -> Result<Json<ListResponse>, ApiError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let limit = query.limit.unwrap_or(50).min(500);
    let (submissions, next) = coordinator.list(status, query.cursor, limit).await?;
    Ok(Json(ListResponse {
        items: submissions.iter().map(view).collect(),
        next,
    }))
}

async fn cancel_submission(State(coordinator): State<Arc<Coordinator>>, Path(id): Path<u64>) -> Result<StatusCode, ApiError> {
    match coordinator.cancel(id).await? {
        CancelOutcome::Cancelled | CancelOutcome::AlreadyTerminal => Ok(StatusCode::NO_CONTENT),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
    store_connected: bool,
    worker_pools: WorkerPoolSizes,
}

#[derive(Serialize)]
struct WorkerPoolSizes {
    fragment: usize,
    qc: usize,
    optimize: usize,
}

async fn health(State(coordinator): State<Arc<Coordinator>>) -> Json<HealthResponse> {
    let counts = coordinator.worker_pool_sizes().await;
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        store_connected: coordinator.store_healthy().await,
        worker_pools: WorkerPoolSizes {
            fragment: counts.fragment_workers,
            qc: counts.qc_workers,
            optimize: counts.optimize_workers,
        },
    })
}
