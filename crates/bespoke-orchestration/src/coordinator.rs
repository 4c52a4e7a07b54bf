//! Coordinator Service (§4.1): owns submission lifecycle, persists
//! submissions before acknowledging them, creates and resumes
//! Orchestrators, and routes worker completions back to the right one.

use std::collections::HashMap;
use std::sync::Arc;

use bespoke_shared::config::ExecutorConfig;
use bespoke_shared::domain::{Submission, SubmissionStatus};
use bespoke_shared::error::{ExecutorError, ExecutorResult};
use bespoke_shared::queue::TaskQueue;
use bespoke_shared::store::ResultStore;
use bespoke_shared::WorkflowDocument;
use bespoke_worker::TaskCompletion;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::orchestrator::{self, OrchestratorDeps, OrchestratorEvent, OrchestratorHandle};
use crate::task_index::TaskIndex;
use bespoke_cache::CacheManager;
use bespoke_shared::cancellation::CancellationRegistry;

/// The outcome of a cancellation request, distinguishing a fresh
/// cancellation from the no-op repeat §8 invariant 6 requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
}

pub struct Coordinator {
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn CacheManager>,
    cancellation: Arc<CancellationRegistry>,
    task_index: Arc<TaskIndex>,
    config: ExecutorConfig,
    orchestrators: Mutex<HashMap<u64, OrchestratorHandle>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<dyn CacheManager>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            cache,
            cancellation: CancellationRegistry::new(),
            task_index: TaskIndex::new(),
            config,
            orchestrators: Mutex::new(HashMap::new()),
        })
    }

    pub fn cancellation(&self) -> Arc<CancellationRegistry> {
        self.cancellation.clone()
    }

    pub fn task_index(&self) -> Arc<TaskIndex> {
        self.task_index.clone()
    }

    fn deps(&self) -> Arc<OrchestratorDeps> {
        Arc::new(OrchestratorDeps {
            store: self.store.clone(),
            queue: self.queue.clone(),
            cache: self.cache.clone(),
            cancellation: self.cancellation.clone(),
            task_index: self.task_index.clone(),
            retry_limits: self.config.retry_limits.clone(),
            lease_ttl: self.config.lease_ttl,
        })
    }

    /// §4.1 "writes the submission and its stage records to the Result
    /// Store *before* responding". Validation failure never creates an
    /// Orchestrator.
    pub async fn submit(self: &Arc<Self>, workflow: Value) -> ExecutorResult<Submission> {
        WorkflowDocument(workflow.clone()).validate()?;
        let id = self.store.next_sequence("submission").await?;
        let submission = Submission::new(id, workflow);
        self.persist(&submission).await?;
        self.spawn(submission.clone()).await;
        Ok(submission)
    }

    pub async fn get(&self, id: u64) -> ExecutorResult<Submission> {
        let bytes = self
            .store
            .get(&format!("sub/{id}"))
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("submission {id}")))?;
        serde_json::from_slice(&bytes).map_err(ExecutorError::internal)
    }

    /// §6.1 `GET /submissions?status=&cursor=&limit=`: cursor is the last
    /// id seen, page boundary is ascending id order.
    pub async fn list(&self, status: Option<SubmissionStatus>, cursor: Option<u64>, limit: usize) -> ExecutorResult<(Vec<Submission>, Option<u64>)> {
        let keys = self.store.scan_prefix("sub/").await?;
        let mut ids: Vec<u64> = keys
            .iter()
            .filter_map(|k| k.strip_prefix("sub/").and_then(|s| s.parse::<u64>().ok()))
            .collect();
        ids.sort_unstable();

        let mut items = Vec::new();
        for id in ids {
            if let Some(cursor) = cursor {
                if id <= cursor {
                    continue;
                }
            }
            let submission = self.get(id).await?;
            if let Some(status) = status {
                if submission.status != status {
                    continue;
                }
            }
            if items.len() == limit {
                break;
            }
            items.push(submission);
        }
        // The next cursor is the last *included* id, so the following page's
        // `id <= cursor` filter starts strictly after the last row this page
        // returned rather than skipping or re-including a boundary row.
        let next = if items.len() == limit { items.last().map(|s| s.id) } else { None };
        Ok((items, next))
    }

    /// §5 "a DELETE marks the submission cancelled ... drops future task
    /// emissions and signals cancellation to in-flight task workers".
    /// Idempotent: repeating the call on an already-terminal submission is
    /// a no-op that still returns success (§8 invariant 6).
    pub async fn cancel(self: &Arc<Self>, id: u64) -> ExecutorResult<CancelOutcome> {
        let submission = self.get(id).await?;
        if submission.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        let handle = self.orchestrators.lock().await.get(&id).cloned();
        match handle {
            Some(handle) => {
                let _ = handle.sender.send(OrchestratorEvent::Cancel).await;
            }
            None => {
                // Orchestrator isn't running (shouldn't normally happen for
                // a non-terminal submission) — resume it just to cancel it.
                self.spawn(submission).await;
                if let Some(handle) = self.orchestrators.lock().await.get(&id).cloned() {
                    let _ = handle.sender.send(OrchestratorEvent::Cancel).await;
                }
            }
        }
        Ok(CancelOutcome::Cancelled)
    }

    /// §4.1 "on boot, the coordinator scans the Result Store for
    /// submissions with non-terminal aggregate status and re-creates an
    /// Orchestrator for each" — no distinct restart event, see
    /// `orchestrator::advance`'s unified resolve path.
    pub async fn resume_at_boot(self: &Arc<Self>) -> ExecutorResult<usize> {
        let keys = self.store.scan_prefix("sub/").await?;
        let mut resumed = 0;
        for key in keys {
            let Some(id) = key.strip_prefix("sub/").and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            let submission = self.get(id).await?;
            if !submission.status.is_terminal() {
                self.spawn(submission).await;
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    pub async fn worker_pool_sizes(&self) -> bespoke_shared::config::WorkerPoolCounts {
        self.config.worker_counts.clone()
    }

    pub async fn store_healthy(&self) -> bool {
        self.store.get("health-probe").await.is_ok()
    }

    async fn spawn(self: &Arc<Self>, submission: Submission) {
        let id = submission.id;
        let (handle, _join) = orchestrator::spawn(submission, self.deps());
        self.orchestrators.lock().await.insert(id, handle);
    }

    async fn persist(&self, submission: &Submission) -> ExecutorResult<()> {
        let bytes = serde_json::to_vec(submission).map_err(ExecutorError::internal)?;
        self.store.put(&format!("sub/{}", submission.id), &bytes).await?;
        for (ordinal, stage) in submission.stages.iter().enumerate() {
            let bytes = serde_json::to_vec(stage).map_err(ExecutorError::internal)?;
            self.store
                .put(&format!("stage/{}/{ordinal}", submission.id), &bytes)
                .await?;
        }
        Ok(())
    }
}

/// The single loop draining the `mpsc::Receiver<TaskCompletion>` every
/// worker pool's `WorkerContext` shares one sender end of, forwarding each
/// completion to the Orchestrator that owns the task (§4.2 "advance").
pub async fn run_completion_dispatcher(coordinator: Arc<Coordinator>, mut completions: mpsc::Receiver<TaskCompletion>) {
    while let Some(completion) = completions.recv().await {
        let task_id = completion.task_id;
        let Some(submission_id) = coordinator.task_index.owner_of(task_id).await else {
            tracing::warn!(%task_id, "completion for an unknown task id, dropping");
            continue;
        };
        let handle = coordinator.orchestrators.lock().await.get(&submission_id).cloned();
        match handle {
            Some(handle) => {
                if handle.sender.send(OrchestratorEvent::TaskCompleted(completion)).await.is_err() {
                    tracing::warn!(submission_id, %task_id, "orchestrator channel closed, dropping completion");
                }
            }
            None => tracing::warn!(submission_id, %task_id, "no live orchestrator for completion"),
        }
        coordinator.task_index.forget(task_id).await;
    }
}
