//! End-to-end scenarios against the in-process default backends (§8
//! S1-S6): `EmbeddedQueue` + file-backed `ResultStore` + in-process
//! `CacheManager` + `EchoExecutor`, requiring no external services.

use std::sync::Arc;
use std::time::Duration;

use bespoke_cache::InMemoryCacheManager;
use bespoke_orchestration::coordinator::{run_completion_dispatcher, CancelOutcome, Coordinator};
use bespoke_shared::backends::{EmbeddedQueue, FileResultStore};
use bespoke_shared::config::{ExecutorConfig, ResourceBudget, RetryLimits, WorkerPoolCounts};
use bespoke_shared::domain::{RoutingKey, SubmissionStatus};
use bespoke_worker::{EchoExecutor, StageExecutor, WorkerContext, WorkerPoolConfig};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

/// Fails QC tasks whose `keywords.i` index is in `failing_indices`, used to
/// exercise the QC stage's tolerance-based acceptance rule (§8 S3) without
/// a real QC program.
struct FailingQcExecutor {
    failing_indices: Vec<i64>,
}

#[async_trait::async_trait]
impl StageExecutor for FailingQcExecutor {
    async fn run(
        &self,
        input: &serde_json::Value,
        _budget: &ResourceBudget,
    ) -> bespoke_shared::error::ExecutorResult<serde_json::Value> {
        let index = input
            .get("qc_spec")
            .and_then(|s| s.get("keywords"))
            .and_then(|k| k.get("i"))
            .and_then(|i| i.as_i64())
            .unwrap_or(-1);
        if self.failing_indices.contains(&index) {
            return Err(bespoke_shared::error::ExecutorError::ExecutorFailed(format!(
                "injected failure for qc task {index}"
            )));
        }
        Ok(json!({"energy": -1.0, "index": index}))
    }
}

struct Stack {
    coordinator: Arc<Coordinator>,
    _worker_shutdown: watch::Sender<bool>,
    _dir: TempDir,
}

async fn bootstrap() -> Stack {
    bootstrap_with_qc_executor(None, RetryLimits { fragment: 0, qc: 2, optimize: 0 }).await
}

/// Like `bootstrap`, but lets a test swap in a non-`EchoExecutor` for the
/// QC pool (e.g. `FailingQcExecutor`) and control the QC retry limit, so a
/// persistent injected failure reaches `TaskStatus::Failed` without
/// waiting out several retry/redelivery cycles.
async fn bootstrap_with_qc_executor(qc_executor: Option<Arc<dyn StageExecutor>>, retry_limits: RetryLimits) -> Stack {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileResultStore::open(dir.path()).await.unwrap());
    let queue = Arc::new(EmbeddedQueue::restore(store.clone()).await.unwrap());
    let cache = Arc::new(InMemoryCacheManager::new());

    let mut config = ExecutorConfig::default();
    config.worker_counts = WorkerPoolCounts {
        fragment_workers: 1,
        qc_workers: 2,
        optimize_workers: 1,
    };
    config.retry_limits = retry_limits;
    config.lease_ttl = Duration::from_secs(10);

    let coordinator = Coordinator::new(store.clone(), queue.clone(), cache.clone(), config.clone());

    let (completion_tx, completion_rx) = mpsc::channel(1024);
    tokio::spawn(run_completion_dispatcher(coordinator.clone(), completion_rx));

    let (worker_shutdown, worker_shutdown_rx) = watch::channel(false);
    for (routing_key, worker_count) in [
        (RoutingKey::Fragment, config.worker_counts.fragment_workers),
        (RoutingKey::Qc, config.worker_counts.qc_workers),
        (RoutingKey::Optimize, config.worker_counts.optimize_workers),
    ] {
        let ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            cache: cache.clone(),
            store: store.clone(),
            cancellation: coordinator.cancellation(),
            completions: completion_tx.clone(),
        });
        let retry_limit = match routing_key {
            RoutingKey::Fragment => config.retry_limits.fragment,
            RoutingKey::Qc => config.retry_limits.qc,
            RoutingKey::Optimize => config.retry_limits.optimize,
        };
        let pool_config = Arc::new(WorkerPoolConfig::new(
            routing_key,
            worker_count,
            ResourceBudget::single_core(),
            retry_limit,
            config.lease_ttl,
        ));
        let executor: Arc<dyn StageExecutor> = match (routing_key, &qc_executor) {
            (RoutingKey::Qc, Some(qc)) => qc.clone(),
            _ => Arc::new(EchoExecutor::new(routing_key.as_str())),
        };
        bespoke_worker::pool::spawn(ctx, pool_config, executor, worker_shutdown_rx.clone());
    }

    Stack {
        coordinator,
        _worker_shutdown: worker_shutdown,
        _dir: dir,
    }
}

fn workflow(qc_tasks: usize, tolerance: Option<f64>) -> serde_json::Value {
    let specs: Vec<_> = (0..qc_tasks)
        .map(|i| json!({"method": "b3lyp-d3bj", "basis": "dzvp", "program": "psi4", "calculation_kind": "optimization", "keywords": {"i": i}}))
        .collect();
    let mut doc = json!({
        "smiles": "CC",
        "fragmenter": {"kind": "wbo"},
        "qc_specs": specs,
        "initial_ff": {"id": "openff-2.1.0"},
        "hyperparameters": {},
        "targets": [],
    });
    if let Some(t) = tolerance {
        doc.as_object_mut().unwrap().insert("qc_failure_tolerance".into(), json!(t));
    }
    doc
}

async fn wait_for_terminal(coordinator: &Arc<Coordinator>, id: u64) -> bespoke_shared::domain::Submission {
    for _ in 0..200 {
        let submission = coordinator.get(id).await.unwrap();
        if submission.status.is_terminal() {
            return submission;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("submission {id} did not reach a terminal status in time");
}

#[tokio::test]
async fn s1_single_bond_submission_reaches_success() {
    let stack = bootstrap().await;
    let submission = stack.coordinator.submit(workflow(1, None)).await.unwrap();
    let finished = wait_for_terminal(&stack.coordinator, submission.id).await;
    assert_eq!(finished.status, SubmissionStatus::Success);
    assert_eq!(finished.stages[1].tasks.len(), 1);
}

#[tokio::test]
async fn s2_cache_warm_second_submission_is_all_cached() {
    let stack = bootstrap().await;
    let first = stack.coordinator.submit(workflow(1, None)).await.unwrap();
    wait_for_terminal(&stack.coordinator, first.id).await;

    let second = stack.coordinator.submit(workflow(1, None)).await.unwrap();
    let finished = wait_for_terminal(&stack.coordinator, second.id).await;
    assert_eq!(finished.status, SubmissionStatus::Success);
}

#[tokio::test]
async fn s6_concurrent_identical_submissions_both_succeed() {
    let stack = bootstrap().await;
    let a = stack.coordinator.submit(workflow(1, None)).await.unwrap();
    let b = stack.coordinator.submit(workflow(1, None)).await.unwrap();
    let (a, b) = tokio::join!(
        wait_for_terminal(&stack.coordinator, a.id),
        wait_for_terminal(&stack.coordinator, b.id)
    );
    assert_eq!(a.status, SubmissionStatus::Success);
    assert_eq!(b.status, SubmissionStatus::Success);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let stack = bootstrap().await;
    let submission = stack.coordinator.submit(workflow(1, None)).await.unwrap();
    let first = stack.coordinator.cancel(submission.id).await.unwrap();
    assert_eq!(first, CancelOutcome::Cancelled);

    let finished = wait_for_terminal(&stack.coordinator, submission.id).await;
    assert_eq!(finished.status, SubmissionStatus::Cancelled);

    let second = stack.coordinator.cancel(submission.id).await.unwrap();
    assert_eq!(second, CancelOutcome::AlreadyTerminal);
}

#[tokio::test]
async fn list_filters_by_status() {
    let stack = bootstrap().await;
    let submission = stack.coordinator.submit(workflow(1, None)).await.unwrap();
    wait_for_terminal(&stack.coordinator, submission.id).await;

    let (items, _next) = stack
        .coordinator
        .list(Some(SubmissionStatus::Success), None, 10)
        .await
        .unwrap();
    assert!(items.iter().any(|s| s.id == submission.id));
}

#[tokio::test]
async fn get_unknown_submission_is_not_found() {
    let stack = bootstrap().await;
    let err = stack.coordinator.get(999_999).await.unwrap_err();
    assert_eq!(err.kind(), "not-found");
}

#[tokio::test]
async fn s3_qc_failure_within_tolerance_still_succeeds() {
    let qc_executor: Arc<dyn StageExecutor> = Arc::new(FailingQcExecutor { failing_indices: vec![0, 1] });
    let stack = bootstrap_with_qc_executor(Some(qc_executor), RetryLimits { fragment: 0, qc: 0, optimize: 0 }).await;

    let submission = stack.coordinator.submit(workflow(4, Some(0.5))).await.unwrap();
    let finished = wait_for_terminal(&stack.coordinator, submission.id).await;

    assert_eq!(finished.status, SubmissionStatus::Success);
    let qc_stage = &finished.stages[1];
    assert_eq!(qc_stage.tasks.len(), 4);
    let failed = qc_stage
        .tasks
        .iter()
        .filter(|t| t.status == bespoke_shared::domain::TaskStatus::Failed)
        .count();
    assert_eq!(failed, 2);
}

/// A QC executor that sleeps long enough for a test to observe the task
/// `in-flight` and cancel the submission before it ever resolves (§8 S4).
struct SlowQcExecutor;

#[async_trait::async_trait]
impl StageExecutor for SlowQcExecutor {
    async fn run(
        &self,
        input: &serde_json::Value,
        _budget: &ResourceBudget,
    ) -> bespoke_shared::error::ExecutorResult<serde_json::Value> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(input.clone())
    }
}

async fn wait_for_qc_in_flight(coordinator: &Arc<Coordinator>, id: u64) {
    for _ in 0..200 {
        let submission = coordinator.get(id).await.unwrap();
        let qc_stage = &submission.stages[1];
        if qc_stage
            .tasks
            .iter()
            .any(|t| t.status == bespoke_shared::domain::TaskStatus::InFlight)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("submission {id} never observed a QC task in-flight");
}

#[tokio::test]
async fn s4_cancellation_mid_flight_discards_in_flight_work() {
    let qc_executor: Arc<dyn StageExecutor> = Arc::new(SlowQcExecutor);
    let stack = bootstrap_with_qc_executor(Some(qc_executor), RetryLimits { fragment: 0, qc: 2, optimize: 0 }).await;

    let submission = stack.coordinator.submit(workflow(2, None)).await.unwrap();
    wait_for_qc_in_flight(&stack.coordinator, submission.id).await;

    stack.coordinator.cancel(submission.id).await.unwrap();
    let finished = wait_for_terminal(&stack.coordinator, submission.id).await;

    assert_eq!(finished.status, SubmissionStatus::Cancelled);
    assert!(finished.stages[2].tasks.is_empty(), "no optimization task should have been emitted");
}

#[tokio::test]
async fn s5_coordinator_restart_resumes_and_reaches_success() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileResultStore::open(dir.path()).await.unwrap());
    let queue = Arc::new(EmbeddedQueue::restore(store.clone()).await.unwrap());
    let cache = Arc::new(InMemoryCacheManager::new());

    let mut config = ExecutorConfig::default();
    config.retry_limits = RetryLimits { fragment: 0, qc: 2, optimize: 0 };
    config.lease_ttl = Duration::from_secs(10);

    // First "process": submit, but never spin up worker pools, so the
    // fragmentation task is durably enqueued and the submission persisted
    // non-terminal — standing in for a coordinator killed mid-flight.
    let first_coordinator = Coordinator::new(store.clone(), queue.clone(), cache.clone(), config.clone());
    let submission = first_coordinator.submit(workflow(1, None)).await.unwrap();
    assert_ne!(submission.status, SubmissionStatus::Success);
    drop(first_coordinator);

    // "Restart": a fresh Coordinator over the same store/queue/cache scans
    // for non-terminal submissions and resumes them (§4.1, §7 "Recovery").
    let second_coordinator = Coordinator::new(store.clone(), queue.clone(), cache.clone(), config.clone());
    let resumed = second_coordinator.resume_at_boot().await.unwrap();
    assert_eq!(resumed, 1);

    let (completion_tx, completion_rx) = mpsc::channel(1024);
    tokio::spawn(run_completion_dispatcher(second_coordinator.clone(), completion_rx));
    let (_worker_shutdown, worker_shutdown_rx) = watch::channel(false);
    for (routing_key, worker_count) in [(RoutingKey::Fragment, 1), (RoutingKey::Qc, 1), (RoutingKey::Optimize, 1)] {
        let ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            cache: cache.clone(),
            store: store.clone(),
            cancellation: second_coordinator.cancellation(),
            completions: completion_tx.clone(),
        });
        let pool_config = Arc::new(WorkerPoolConfig::new(routing_key, worker_count, ResourceBudget::single_core(), 0, config.lease_ttl));
        bespoke_worker::pool::spawn(ctx, pool_config, Arc::new(EchoExecutor::new(routing_key.as_str())), worker_shutdown_rx.clone());
    }

    let finished = wait_for_terminal(&second_coordinator, submission.id).await;
    assert_eq!(finished.status, SubmissionStatus::Success);
}

#[tokio::test]
async fn s3_qc_failure_beyond_tolerance_errors_submission() {
    let qc_executor: Arc<dyn StageExecutor> = Arc::new(FailingQcExecutor { failing_indices: vec![0, 1, 2] });
    let stack = bootstrap_with_qc_executor(Some(qc_executor), RetryLimits { fragment: 0, qc: 0, optimize: 0 }).await;

    let submission = stack.coordinator.submit(workflow(4, Some(0.5))).await.unwrap();
    let finished = wait_for_terminal(&stack.coordinator, submission.id).await;

    assert_eq!(finished.status, SubmissionStatus::Errored);
    assert!(finished.error.is_some());
}
