//! # Stage Orchestrator (§4.2)
//!
//! One actor per submission, reacting to three event kinds: a task
//! completion reported by a worker pool (*advance*), a cancellation
//! request, and the resolution of a fingerprint this orchestrator was
//! waiting on (another submission's task publishing or releasing a lease
//! it held). The actor owns its `Submission` exclusively — all mutation is
//! serialized through one `mpsc` inbox, so no lock needs to span an
//! `.await` (§5 "each Orchestrator is logically single-threaded").

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bespoke_cache::{AcquireOutcome, CacheLookup, CacheManager};
use bespoke_shared::cancellation::CancellationRegistry;
use bespoke_shared::config::RetryLimits;
use bespoke_shared::domain::{
    RoutingKey, StageKind, StageRecord, StageStatus, Submission, SubmissionStatus, TaskRecord,
    TaskStatus,
};
use bespoke_shared::error::ExecutorError;
use bespoke_shared::fingerprint::{canonicalize_sorted_array, fingerprint_parts};
use bespoke_shared::queue::{TaskEnvelope, TaskQueue};
use bespoke_shared::store::ResultStore;
use bespoke_shared::WorkflowDocument;
use bespoke_worker::{TaskCompletion, TaskOutcome};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::task_index::TaskIndex;

/// Everything every Orchestrator actor shares, threaded in explicitly
/// rather than held in a global (§9 "Singleton settings module becomes an
/// explicit configuration value").
pub struct OrchestratorDeps {
    pub store: Arc<dyn ResultStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub cache: Arc<dyn CacheManager>,
    pub cancellation: Arc<CancellationRegistry>,
    pub task_index: Arc<TaskIndex>,
    pub retry_limits: RetryLimits,
    pub lease_ttl: Duration,
}

/// Events an Orchestrator actor reacts to (§4.2 "reacts to three event
/// kinds: advance, cancel, and restart"). `Restart` is not a distinct
/// variant here: a reloaded submission is simply handed to [`spawn`] the
/// same way a freshly created one is, and the first `advance()` pass
/// naturally resubscribes to any task left in-flight by a crash.
pub enum OrchestratorEvent {
    TaskCompleted(TaskCompletion),
    CacheResolved {
        task_id: Uuid,
        fingerprint: String,
        lookup: CacheLookup,
    },
    Cancel,
}

#[derive(Clone)]
pub struct OrchestratorHandle {
    pub submission_id: u64,
    pub sender: mpsc::Sender<OrchestratorEvent>,
}

/// Spawn the actor task for one submission (fresh or resumed at boot) and
/// return a handle the Coordinator can route events through.
pub fn spawn(submission: Submission, deps: Arc<OrchestratorDeps>) -> (OrchestratorHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let handle = OrchestratorHandle {
        submission_id: submission.id,
        sender: tx.clone(),
    };
    let join = tokio::spawn(run(submission, deps, tx, rx));
    (handle, join)
}

struct State {
    submission: Submission,
    /// Fingerprints this orchestrator has an active `wait_for_resolution`
    /// subscription on, so a later `advance()` pass doesn't pile up
    /// duplicate subscriptions for the same waiting task.
    subscribed: HashSet<String>,
}

async fn run(
    submission: Submission,
    deps: Arc<OrchestratorDeps>,
    self_tx: mpsc::Sender<OrchestratorEvent>,
    mut rx: mpsc::Receiver<OrchestratorEvent>,
) {
    let mut state = State {
        submission,
        subscribed: HashSet::new(),
    };

    advance(&mut state, &deps, &self_tx).await;
    persist(&deps, &state.submission).await;

    while !state.submission.status.is_terminal() {
        let Some(event) = rx.recv().await else {
            break;
        };
        match event {
            OrchestratorEvent::TaskCompleted(completion) => {
                apply_completion(&mut state, &completion);
                advance(&mut state, &deps, &self_tx).await;
            }
            OrchestratorEvent::CacheResolved { task_id, fingerprint, lookup } => {
                state.subscribed.remove(&fingerprint);
                apply_cache_resolution(&mut state, task_id, lookup);
                advance(&mut state, &deps, &self_tx).await;
            }
            OrchestratorEvent::Cancel => {
                cancel(&mut state, &deps).await;
            }
        }
        persist(&deps, &state.submission).await;
    }

    tracing::info!(submission_id = state.submission.id, status = ?state.submission.status, "submission reached terminal status");
}

/// §4.2 steps 1-5, re-run from the top each time something may have
/// changed: find the earliest non-terminal stage, materialize its tasks if
/// this is the first visit, resolve every pending/in-flight task against
/// the cache, and aggregate once the whole stage is terminal.
async fn advance(state: &mut State, deps: &Arc<OrchestratorDeps>, self_tx: &mpsc::Sender<OrchestratorEvent>) {
    if state.submission.status.is_terminal() {
        return;
    }

    loop {
        let Some(idx) = state.submission.stages.iter().position(|s| !s.status.is_terminal()) else {
            state.submission.status = SubmissionStatus::Success;
            return;
        };

        if state.submission.status == SubmissionStatus::Waiting {
            state.submission.status = SubmissionStatus::Running;
        }
        if state.submission.stages[idx].status == StageStatus::Pending {
            state.submission.stages[idx].status = StageStatus::Running;
        }

        if state.submission.stages[idx].tasks.is_empty() {
            let tasks = materialize(&state.submission, idx, deps).await;
            state.submission.stages[idx].tasks = tasks;
            if state.submission.stages[idx].tasks.is_empty() {
                // A stage with nothing to do (e.g. a workflow declaring no
                // QC specs) is vacuously satisfied (§4.2 step 4).
                state.submission.stages[idx].status = StageStatus::Success;
                state.submission.stages[idx].output = Some(json!({"results": []}));
                continue;
            }
        }

        let pending_or_in_flight: Vec<usize> = state.submission.stages[idx]
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.status.is_terminal())
            .map(|(i, _)| i)
            .collect();
        for i in pending_or_in_flight {
            resolve_task(state, idx, i, deps, self_tx).await;
        }

        let all_terminal = state.submission.stages[idx].tasks.iter().all(|t| t.status.is_terminal());
        if !all_terminal {
            return;
        }

        if stage_accepted(&state.submission, idx) {
            state.submission.stages[idx].output = Some(aggregate_output(&state.submission, idx, deps).await);
            state.submission.stages[idx].status = StageStatus::Success;
            continue;
        }

        let stage_name = state.submission.stages[idx].kind.name();
        state.submission.stages[idx].status = StageStatus::Errored;
        state.submission.stages[idx].error = Some(format!("{stage_name} stage failed its acceptance rule"));
        for later in state.submission.stages.iter_mut().skip(idx + 1) {
            if !later.status.is_terminal() {
                later.status = StageStatus::Skipped;
            }
        }
        state.submission.status = SubmissionStatus::Errored;
        state.submission.error = Some(format!("stage '{stage_name}' errored"));
        return;
    }
}

/// Resolve one task against the Cache Manager (§4.2 step 3). A task that
/// is `Pending` attempts to acquire the fingerprint's lease; one that is
/// already `InFlight` (the lease owner, possibly from before a crash) is
/// only re-checked for completion, never re-enqueued, since the durably
/// persisted queue item survives a restart on its own (§7).
async fn resolve_task(state: &mut State, stage_idx: usize, task_idx: usize, deps: &Arc<OrchestratorDeps>, self_tx: &mpsc::Sender<OrchestratorEvent>) {
    let task_id = state.submission.stages[stage_idx].tasks[task_idx].task_id;
    let fingerprint = state.submission.stages[stage_idx].tasks[task_idx].fingerprint.clone();
    let status = state.submission.stages[stage_idx].tasks[task_idx].status;

    match status {
        TaskStatus::InFlight => match deps.cache.lookup(&fingerprint).await {
            Ok(CacheLookup::Hit(entry)) => mark_cached(state, stage_idx, task_idx, &entry.fingerprint),
            Ok(CacheLookup::Miss) => subscribe_once(state, deps, self_tx, task_id, fingerprint),
            Err(e) => mark_failed(state, stage_idx, task_idx, &e.public_message()),
        },
        TaskStatus::Pending => {
            let routing_key = state.submission.stages[stage_idx].kind.routing_key();
            match deps.cache.acquire(&fingerprint, task_id, deps.lease_ttl).await {
                Ok(AcquireOutcome::Hit(entry)) => mark_cached(state, stage_idx, task_idx, &entry.fingerprint),
                Ok(AcquireOutcome::HeldBy(_owner)) => subscribe_once(state, deps, self_tx, task_id, fingerprint),
                Ok(AcquireOutcome::Granted) => {
                    dispatch_task(state, deps, stage_idx, task_idx, routing_key, task_id, &fingerprint).await;
                }
                Err(e) => mark_failed(state, stage_idx, task_idx, &e.public_message()),
            }
        }
        _ => {}
    }
}

async fn dispatch_task(
    state: &mut State,
    deps: &Arc<OrchestratorDeps>,
    stage_idx: usize,
    task_idx: usize,
    routing_key: RoutingKey,
    task_id: Uuid,
    fingerprint: &str,
) {
    let input = state.submission.stages[stage_idx].tasks[task_idx].input.clone();
    let envelope = TaskEnvelope {
        fingerprint: fingerprint.to_string(),
        lease_owner: task_id,
        input,
    };
    let payload = match serde_json::to_value(&envelope) {
        Ok(v) => v,
        Err(e) => {
            let _ = deps.cache.release(fingerprint, task_id).await;
            mark_failed(state, stage_idx, task_idx, &format!("failed to encode task envelope: {e}"));
            return;
        }
    };

    match deps.queue.enqueue(routing_key, task_id, payload).await {
        Ok(()) => {
            state.submission.stages[stage_idx].tasks[task_idx].status = TaskStatus::InFlight;
            deps.task_index.register(task_id, state.submission.id).await;
            persist_task(deps, &state.submission.stages[stage_idx].tasks[task_idx]).await;
        }
        Err(e) => {
            let _ = deps.cache.release(fingerprint, task_id).await;
            mark_failed(state, stage_idx, task_idx, &e.public_message());
        }
    }
}

fn subscribe_once(state: &mut State, deps: &Arc<OrchestratorDeps>, self_tx: &mpsc::Sender<OrchestratorEvent>, task_id: Uuid, fingerprint: String) {
    if !state.subscribed.insert(fingerprint.clone()) {
        return;
    }
    let cache = deps.cache.clone();
    let self_tx = self_tx.clone();
    tokio::spawn(async move {
        let lookup = cache.wait_for_resolution(&fingerprint).await.unwrap_or(CacheLookup::Miss);
        let _ = self_tx
            .send(OrchestratorEvent::CacheResolved { task_id, fingerprint, lookup })
            .await;
    });
}

fn mark_cached(state: &mut State, stage_idx: usize, task_idx: usize, fingerprint: &str) {
    let task = &mut state.submission.stages[stage_idx].tasks[task_idx];
    task.status = TaskStatus::Cached;
    task.result_ref = Some(format!("cache/{fingerprint}"));
}

fn mark_failed(state: &mut State, stage_idx: usize, task_idx: usize, message: &str) {
    let task = &mut state.submission.stages[stage_idx].tasks[task_idx];
    task.status = TaskStatus::Failed;
    task.last_error = Some(message.to_string());
}

async fn persist_task(deps: &Arc<OrchestratorDeps>, task: &TaskRecord) {
    if let Ok(bytes) = serde_json::to_vec(task) {
        let _ = deps.store.put(&format!("task/{}", task.task_id), &bytes).await;
    }
}

fn apply_completion(state: &mut State, completion: &TaskCompletion) {
    let Some((stage_idx, task_idx)) = find_task(&state.submission, completion.task_id) else {
        tracing::warn!(task_id = %completion.task_id, "completion for a task not owned by this submission");
        return;
    };
    let task = &mut state.submission.stages[stage_idx].tasks[task_idx];
    match &completion.outcome {
        TaskOutcome::Succeeded { fingerprint } => {
            task.status = TaskStatus::Succeeded;
            task.result_ref = Some(format!("cache/{fingerprint}"));
        }
        TaskOutcome::Failed { message, .. } => {
            task.status = TaskStatus::Failed;
            task.last_error = Some(message.clone());
        }
        TaskOutcome::Cancelled => {
            task.status = TaskStatus::Failed;
            task.last_error = Some("cancelled".to_string());
        }
    }
}

fn apply_cache_resolution(state: &mut State, task_id: Uuid, lookup: CacheLookup) {
    let Some((stage_idx, task_idx)) = find_task(&state.submission, task_id) else {
        return;
    };
    match lookup {
        CacheLookup::Hit(entry) => mark_cached(state, stage_idx, task_idx, &entry.fingerprint),
        // The lease was released without a publish; the task stays Pending
        // so the next `advance()` pass re-attempts `acquire` (§4.3 "one
        // waiter is promoted to Granted").
        CacheLookup::Miss => {
            state.submission.stages[stage_idx].tasks[task_idx].status = TaskStatus::Pending;
        }
    }
}

fn find_task(submission: &Submission, task_id: Uuid) -> Option<(usize, usize)> {
    for (si, stage) in submission.stages.iter().enumerate() {
        if let Some(ti) = stage.tasks.iter().position(|t| t.task_id == task_id) {
            return Some((si, ti));
        }
    }
    None
}

/// §4.2 step 2: build the ordered Task Records for one stage, the first
/// time it is visited.
async fn materialize(submission: &Submission, idx: usize, deps: &Arc<OrchestratorDeps>) -> Vec<TaskRecord> {
    let workflow = WorkflowDocument(submission.workflow.clone());
    match submission.stages[idx].kind {
        StageKind::Fragmentation => vec![build_fragmentation_task(&workflow)],
        StageKind::QcGeneration => {
            let fragmentation_output = submission.stages[StageKind::Fragmentation.ordinal()]
                .output
                .clone()
                .unwrap_or(Value::Null);
            build_qc_tasks(&workflow, &fragmentation_output)
        }
        StageKind::Optimization => {
            let qc_results = collect_qc_results(submission, deps).await;
            vec![build_optimization_task(&workflow, qc_results)]
        }
    }
}

fn build_fragmentation_task(workflow: &WorkflowDocument) -> TaskRecord {
    let parent = workflow.parent_molecule();
    let spec = workflow.fragmenter_spec();
    let fingerprint = fingerprint_parts(&[
        ("stage", &json!("fragmentation")),
        ("parent-molecule", &parent),
        ("fragmenter-spec", &spec),
    ]);
    let input = json!({"parent_molecule": parent, "fragmenter": spec});
    TaskRecord::new(fingerprint, RoutingKey::Fragment, input)
}

fn build_qc_tasks(workflow: &WorkflowDocument, fragmentation_output: &Value) -> Vec<TaskRecord> {
    let fragments = bespoke_shared::fragments_of(fragmentation_output);
    let specs = workflow.qc_specs();
    let mut tasks = Vec::with_capacity(fragments.len() * specs.len());
    for fragment in &fragments {
        let canonical = bespoke_shared::fragment_canonical(fragment);
        for spec in &specs {
            let method = spec.get("method").cloned().unwrap_or(Value::Null);
            let basis = spec.get("basis").cloned().unwrap_or(Value::Null);
            let program = spec.get("program").cloned().unwrap_or(Value::Null);
            let calculation_kind = spec.get("calculation_kind").cloned().unwrap_or(Value::Null);
            let keywords = spec.get("keywords").cloned().unwrap_or(Value::Null);
            let fingerprint = fingerprint_parts(&[
                ("stage", &json!("qc-generation")),
                ("fragment-canonical", &canonical),
                ("qc-method", &method),
                ("qc-basis", &basis),
                ("qc-program", &program),
                ("calculation-kind", &calculation_kind),
                ("auxiliary-keywords", &keywords),
            ]);
            let input = json!({"fragment": fragment, "qc_spec": spec});
            tasks.push(TaskRecord::new(fingerprint, RoutingKey::Qc, input));
        }
    }
    tasks
}

fn build_optimization_task(workflow: &WorkflowDocument, qc_results: Vec<Value>) -> TaskRecord {
    let initial_ff = workflow.initial_ff();
    let hyperparameters = workflow.hyperparameters();
    let mut combined = workflow.targets();
    combined.extend(qc_results);
    let combined_key = json!(canonicalize_sorted_array(&combined));
    let fingerprint = fingerprint_parts(&[
        ("stage", &json!("optimization")),
        ("initial-ff", &initial_ff),
        ("hyperparameters", &hyperparameters),
        ("targets-and-qc-results", &combined_key),
    ]);
    let input = json!({
        "initial_ff": initial_ff,
        "hyperparameters": hyperparameters,
        "targets_and_qc_results": combined,
    });
    TaskRecord::new(fingerprint, RoutingKey::Optimize, input)
}

/// Gathers the stage output of every QC task that resolved successfully
/// (`succeeded` or `cached`), skipping any that exhausted their retries —
/// the QC stage's acceptance rule already decided those are tolerable
/// (§4.2 step 4).
async fn collect_qc_results(submission: &Submission, deps: &Arc<OrchestratorDeps>) -> Vec<Value> {
    let qc_stage = &submission.stages[StageKind::QcGeneration.ordinal()];
    let mut results = Vec::new();
    for task in &qc_stage.tasks {
        if matches!(task.status, TaskStatus::Succeeded | TaskStatus::Cached) {
            if let Ok(CacheLookup::Hit(entry)) = deps.cache.lookup(&task.fingerprint).await {
                results.push(entry.value);
            }
        }
    }
    results
}

/// §4.2 step 4's per-stage acceptance rule.
fn stage_accepted(submission: &Submission, idx: usize) -> bool {
    let stage = &submission.stages[idx];
    match stage.kind {
        StageKind::Fragmentation | StageKind::Optimization => {
            stage.tasks.iter().all(|t| matches!(t.status, TaskStatus::Succeeded | TaskStatus::Cached))
        }
        StageKind::QcGeneration => {
            if stage.tasks.is_empty() {
                return true;
            }
            let failed = stage.tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
            match WorkflowDocument(submission.workflow.clone()).qc_failure_tolerance() {
                Some(tolerance) => (failed as f64 / stage.tasks.len() as f64) <= tolerance,
                None => failed == 0,
            }
        }
    }
}

async fn aggregate_output(submission: &Submission, idx: usize, deps: &Arc<OrchestratorDeps>) -> Value {
    let stage = &submission.stages[idx];
    match stage.kind {
        StageKind::Fragmentation | StageKind::Optimization => match stage.tasks.first() {
            Some(task) => match deps.cache.lookup(&task.fingerprint).await {
                Ok(CacheLookup::Hit(entry)) => entry.value,
                _ => Value::Null,
            },
            None => Value::Null,
        },
        StageKind::QcGeneration => {
            let mut results = Vec::new();
            let mut failed_count = 0usize;
            for task in &stage.tasks {
                match task.status {
                    TaskStatus::Succeeded | TaskStatus::Cached => {
                        if let Ok(CacheLookup::Hit(entry)) = deps.cache.lookup(&task.fingerprint).await {
                            results.push(entry.value);
                        }
                    }
                    TaskStatus::Failed => failed_count += 1,
                    _ => {}
                }
            }
            json!({"results": results, "failed": failed_count, "total": stage.tasks.len()})
        }
    }
}

/// §5 "a DELETE marks the submission cancelled, drops future task
/// emissions, and signals cancellation to in-flight task workers".
async fn cancel(state: &mut State, deps: &Arc<OrchestratorDeps>) {
    if state.submission.status.is_terminal() {
        return;
    }
    state.submission.status = SubmissionStatus::Cancelled;
    for stage in &mut state.submission.stages {
        if stage.status.is_terminal() {
            continue;
        }
        for task in &mut stage.tasks {
            match task.status {
                TaskStatus::InFlight => deps.cancellation.cancel(task.task_id).await,
                TaskStatus::Pending => {
                    task.status = TaskStatus::Failed;
                    task.last_error = Some("cancelled".to_string());
                }
                _ => {}
            }
        }
        stage.status = StageStatus::Skipped;
    }
}

async fn persist(deps: &Arc<OrchestratorDeps>, submission: &Submission) {
    if let Ok(bytes) = serde_json::to_vec(submission) {
        let _ = deps.store.put(&format!("sub/{}", submission.id), &bytes).await;
    }
    for (ordinal, stage) in submission.stages.iter().enumerate() {
        persist_stage(deps, submission.id, ordinal, stage).await;
    }
}

async fn persist_stage(deps: &Arc<OrchestratorDeps>, submission_id: u64, ordinal: usize, stage: &StageRecord) {
    if let Ok(bytes) = serde_json::to_vec(stage) {
        let _ = deps.store.put(&format!("stage/{submission_id}/{ordinal}"), &bytes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bespoke_cache::InMemoryCacheManager;
    use bespoke_shared::backends::{EmbeddedQueue, FileResultStore};
    use bespoke_shared::cancellation::CancellationRegistry;
    use bespoke_worker::EchoExecutor;
    use serde_json::json;
    use tempfile::tempdir;

    async fn deps() -> (Arc<OrchestratorDeps>, Arc<dyn TaskQueue>, Arc<dyn CacheManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ResultStore> = Arc::new(FileResultStore::open(dir.path()).await.unwrap());
        let queue: Arc<dyn TaskQueue> = Arc::new(EmbeddedQueue::restore(store.clone()).await.unwrap());
        let cache: Arc<dyn CacheManager> = Arc::new(InMemoryCacheManager::new());
        let deps = Arc::new(OrchestratorDeps {
            store,
            queue: queue.clone(),
            cache: cache.clone(),
            cancellation: CancellationRegistry::new(),
            task_index: TaskIndex::new(),
            retry_limits: RetryLimits::default(),
            lease_ttl: Duration::from_secs(60),
        });
        (deps, queue, cache, dir)
    }

    fn workflow_one_fragment_one_qc() -> Value {
        json!({
            "smiles": "CC",
            "fragmenter": {"kind": "wbo"},
            "qc_specs": [{"method": "b3lyp-d3bj", "basis": "dzvp", "program": "psi4", "calculation_kind": "optimization"}],
            "initial_ff": {"id": "openff-2.1.0"},
            "hyperparameters": {},
            "targets": [],
        })
    }

    async fn drain_and_complete_one(queue: &Arc<dyn TaskQueue>, cache: &Arc<dyn CacheManager>, routing_key: RoutingKey) -> TaskCompletion {
        let items = queue.claim(routing_key, 60, 1).await.unwrap();
        let item = items.into_iter().next().expect("a task should have been enqueued");
        let envelope: TaskEnvelope = serde_json::from_value(item.payload.clone()).unwrap();
        let executor = EchoExecutor::new(routing_key.as_str());
        let budget = bespoke_shared::config::ResourceBudget::single_core();
        let output = {
            use bespoke_worker::StageExecutor;
            executor.run(&envelope.input, &budget).await.unwrap()
        };
        cache.publish(&envelope.fingerprint, output, envelope.lease_owner, "test-worker".into()).await.unwrap();
        queue.ack(&item).await.unwrap();
        TaskCompletion {
            task_id: item.task_id,
            routing_key,
            outcome: TaskOutcome::Succeeded { fingerprint: envelope.fingerprint },
        }
    }

    #[tokio::test]
    async fn fragmentation_stage_produces_exactly_one_task() {
        let (deps, _queue, _cache, _dir) = deps().await;
        let submission = Submission::new(1, workflow_one_fragment_one_qc());
        let (handle, _join) = spawn(submission, deps);
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);
    }

    #[tokio::test]
    async fn full_pipeline_single_fragment_reaches_success() {
        let (deps, queue, cache, _dir) = deps().await;
        let submission = Submission::new(1, workflow_one_fragment_one_qc());
        let (handle, join) = spawn(submission, deps);

        // Fragmentation -> one fragment output consumed by the QC stage.
        let fragment_output = json!({"fragments": [{"canonical": "CC"}]});
        // Drive the fragmentation task to completion with a fixed output so
        // the QC stage has exactly one fragment to generate a task for.
        let items = queue.claim(RoutingKey::Fragment, 60, 1).await.unwrap();
        let item = items.into_iter().next().unwrap();
        let envelope: TaskEnvelope = serde_json::from_value(item.payload.clone()).unwrap();
        cache.publish(&envelope.fingerprint, fragment_output, envelope.lease_owner, "test".into()).await.unwrap();
        queue.ack(&item).await.unwrap();
        handle
            .sender
            .send(OrchestratorEvent::TaskCompleted(TaskCompletion {
                task_id: item.task_id,
                routing_key: RoutingKey::Fragment,
                outcome: TaskOutcome::Succeeded { fingerprint: envelope.fingerprint },
            }))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let completion = drain_and_complete_one(&queue, &cache, RoutingKey::Qc).await;
        handle.sender.send(OrchestratorEvent::TaskCompleted(completion)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let completion = drain_and_complete_one(&queue, &cache, RoutingKey::Optimize).await;
        handle.sender.send(OrchestratorEvent::TaskCompleted(completion)).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), join).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancel_before_any_progress_is_immediately_terminal() {
        let (deps, _queue, _cache, _dir) = deps().await;
        let submission = Submission::new(1, workflow_one_fragment_one_qc());
        let (handle, join) = spawn(submission, deps);
        handle.sender.send(OrchestratorEvent::Cancel).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), join).await;
        assert!(result.is_ok());
    }

    #[test]
    fn stage_acceptance_qc_defaults_to_any_failure_fails() {
        let mut submission = Submission::new(1, json!({}));
        submission.stages[1].tasks = vec![
            TaskRecord::new("a".into(), RoutingKey::Qc, Value::Null),
            TaskRecord::new("b".into(), RoutingKey::Qc, Value::Null),
        ];
        submission.stages[1].tasks[0].status = TaskStatus::Succeeded;
        submission.stages[1].tasks[1].status = TaskStatus::Failed;
        assert!(!stage_accepted(&submission, 1));
    }

    #[test]
    fn stage_acceptance_qc_honors_declared_tolerance() {
        let mut submission = Submission::new(1, json!({"qc_failure_tolerance": 0.5}));
        submission.stages[1].tasks = vec![
            TaskRecord::new("a".into(), RoutingKey::Qc, Value::Null),
            TaskRecord::new("b".into(), RoutingKey::Qc, Value::Null),
        ];
        submission.stages[1].tasks[0].status = TaskStatus::Succeeded;
        submission.stages[1].tasks[1].status = TaskStatus::Failed;
        assert!(stage_accepted(&submission, 1));
    }

    #[test]
    fn stage_acceptance_fragmentation_never_tolerates_failure() {
        let mut submission = Submission::new(1, json!({"qc_failure_tolerance": 1.0}));
        submission.stages[0].tasks = vec![TaskRecord::new("a".into(), RoutingKey::Fragment, Value::Null)];
        submission.stages[0].tasks[0].status = TaskStatus::Failed;
        assert!(!stage_accepted(&submission, 0));
    }
}
