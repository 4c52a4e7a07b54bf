//! Worker Pool (§4.4): three logical pools distinguished by routing key,
//! each a fixed number of loops claiming queue items, invoking a
//! [`StageExecutor`], and publishing results to the Cache Manager.

use std::sync::Arc;
use std::time::Duration;

use bespoke_cache::CacheManager;
use bespoke_shared::cancellation::CancellationRegistry;
use bespoke_shared::config::ResourceBudget;
use bespoke_shared::domain::{RoutingKey, TaskRecord, TaskStatus};
use bespoke_shared::error::{ExecutorError, ExecutorResult};
use bespoke_shared::queue::{QueueItem, TaskEnvelope, TaskQueue};
use bespoke_shared::store::ResultStore;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::executor::StageExecutor;

/// How a claimed task ultimately resolved, reported back to whatever is
/// advancing the owning Stage Orchestrator (§4.2 "advance" event).
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded { fingerprint: String },
    Failed { kind: &'static str, message: String },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task_id: Uuid,
    pub routing_key: RoutingKey,
    pub outcome: TaskOutcome,
}

/// Everything a worker loop needs, shared across every worker in every pool
/// (§5 "the Cache Manager is the only mutator of Cache Entries and
/// Leases... the Task Queue is the only mutator of queue state").
pub struct WorkerContext {
    pub queue: Arc<dyn TaskQueue>,
    pub cache: Arc<dyn CacheManager>,
    pub store: Arc<dyn ResultStore>,
    pub cancellation: Arc<CancellationRegistry>,
    pub completions: tokio::sync::mpsc::Sender<TaskCompletion>,
}

/// Per-pool tuning, one instance per routing key (§6.2 worker counts,
/// core budgets, and retry limits).
pub struct WorkerPoolConfig {
    pub routing_key: RoutingKey,
    pub worker_count: usize,
    pub budget: ResourceBudget,
    pub lease_ttl: Duration,
    pub lease_heartbeat: Duration,
    pub retry_limit: u32,
    /// §4.4 step 1: "visibility timeout equal to `expected_duration × 2`".
    /// The configuration surface (§6.2) has no separate expected-duration
    /// knob, so this is derived as `lease_ttl * 2` — a lease that has not
    /// been heartbeated away inside one TTL is assumed stalled either way.
    pub visibility_timeout_secs: u64,
    pub poll_interval: Duration,
    pub producer_label: String,
}

impl WorkerPoolConfig {
    pub fn new(routing_key: RoutingKey, worker_count: usize, budget: ResourceBudget, retry_limit: u32, lease_ttl: Duration) -> Self {
        Self {
            routing_key,
            worker_count,
            budget,
            lease_ttl,
            lease_heartbeat: lease_ttl / 3,
            retry_limit,
            visibility_timeout_secs: lease_ttl.as_secs() * 2,
            poll_interval: Duration::from_millis(250),
            producer_label: format!("worker-{routing_key}"),
        }
    }
}

/// Spawn `config.worker_count` independent loops for one routing key.
/// Returned handles are aborted by the caller (the Supervisor) on shutdown
/// after `shutdown` is flipped and the grace period elapses.
pub fn spawn(
    ctx: Arc<WorkerContext>,
    config: Arc<WorkerPoolConfig>,
    executor: Arc<dyn StageExecutor>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..config.worker_count)
        .map(|index| {
            let ctx = ctx.clone();
            let config = config.clone();
            let executor = executor.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        claimed = ctx.queue.claim(config.routing_key, config.visibility_timeout_secs, 1) => {
                            match claimed {
                                Ok(items) if items.is_empty() => {
                                    tokio::time::sleep(config.poll_interval).await;
                                }
                                Ok(items) => {
                                    for item in items {
                                        process_item(&ctx, &config, &executor, item, index).await;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, routing_key = %config.routing_key, "queue claim failed");
                                    tokio::time::sleep(config.poll_interval).await;
                                }
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

async fn process_item(
    ctx: &Arc<WorkerContext>,
    config: &WorkerPoolConfig,
    executor: &Arc<dyn StageExecutor>,
    item: QueueItem,
    worker_index: usize,
) {
    let envelope: TaskEnvelope = match serde_json::from_value(item.payload.clone()) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(task_id = %item.task_id, error = %e, "malformed task envelope, dropping");
            let _ = ctx.queue.ack(&item).await;
            return;
        }
    };

    if ctx.cancellation.is_cancelled(item.task_id).await {
        let _ = ctx.cache.release(&envelope.fingerprint, envelope.lease_owner).await;
        record_terminal(ctx, item.task_id, config.routing_key, &envelope, TaskStatus::Failed, Some("cancelled".to_string())).await;
        let _ = ctx.queue.ack(&item).await;
        ctx.cancellation.clear(item.task_id).await;
        send_completion(ctx, item.task_id, config.routing_key, TaskOutcome::Cancelled).await;
        return;
    }

    let heartbeat_handle = spawn_heartbeat(ctx.clone(), item.clone(), envelope.clone(), config.lease_ttl, config.lease_heartbeat, config.visibility_timeout_secs);

    let outcome = run_with_cancellation(ctx, executor, &envelope, &config.budget, item.task_id).await;
    heartbeat_handle.abort();

    match outcome {
        Ok(value) => handle_success(ctx, config, item, envelope, value, worker_index).await,
        Err(ExecutorError::Cancelled(_)) => handle_cancelled(ctx, config, item, envelope).await,
        Err(e) => handle_failure(ctx, config, item, envelope, e).await,
    }
}

async fn run_with_cancellation(
    ctx: &Arc<WorkerContext>,
    executor: &Arc<dyn StageExecutor>,
    envelope: &TaskEnvelope,
    budget: &ResourceBudget,
    task_id: Uuid,
) -> ExecutorResult<Value> {
    let cancellation = ctx.cancellation.clone();
    tokio::select! {
        result = executor.run(&envelope.input, budget) => result,
        _ = watch_for_cancellation(cancellation, task_id) => Err(ExecutorError::Cancelled("observed during execution".to_string())),
    }
}

async fn watch_for_cancellation(cancellation: Arc<CancellationRegistry>, task_id: Uuid) {
    loop {
        if cancellation.is_cancelled(task_id).await {
            return;
        }
        cancellation.wait_for_any_change().await;
    }
}

fn spawn_heartbeat(
    ctx: Arc<WorkerContext>,
    item: QueueItem,
    envelope: TaskEnvelope,
    lease_ttl: Duration,
    lease_heartbeat: Duration,
    visibility_timeout_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(lease_heartbeat);
        loop {
            ticker.tick().await;
            let _ = ctx.cache.heartbeat(&envelope.fingerprint, envelope.lease_owner, lease_ttl).await;
            let _ = ctx.queue.extend_visibility(&item, visibility_timeout_secs).await;
        }
    })
}

async fn handle_success(
    ctx: &Arc<WorkerContext>,
    config: &WorkerPoolConfig,
    item: QueueItem,
    envelope: TaskEnvelope,
    value: Value,
    worker_index: usize,
) {
    let produced_by = format!("{}-{worker_index}", config.producer_label);
    let published = ctx
        .cache
        .publish(&envelope.fingerprint, value, envelope.lease_owner, produced_by)
        .await
        .unwrap_or(false);

    if published {
        record_terminal(ctx, item.task_id, config.routing_key, &envelope, TaskStatus::Succeeded, None).await;
        let _ = ctx.queue.ack(&item).await;
        send_completion(
            ctx,
            item.task_id,
            config.routing_key,
            TaskOutcome::Succeeded {
                fingerprint: envelope.fingerprint.clone(),
            },
        )
        .await;
    } else {
        // The lease was reaped or stolen before we could publish (§4.3
        // "a stale publish is rejected and the value is discarded"); the
        // work is wasted but not observably wrong.
        record_terminal(
            ctx,
            item.task_id,
            config.routing_key,
            &envelope,
            TaskStatus::Failed,
            Some("lease lost before publish".to_string()),
        )
        .await;
        let _ = ctx.queue.ack(&item).await;
        send_completion(
            ctx,
            item.task_id,
            config.routing_key,
            TaskOutcome::Failed {
                kind: "worker-crashed",
                message: "lease lost before publish".to_string(),
            },
        )
        .await;
    }
}

async fn handle_cancelled(ctx: &Arc<WorkerContext>, config: &WorkerPoolConfig, item: QueueItem, envelope: TaskEnvelope) {
    let _ = ctx.cache.release(&envelope.fingerprint, envelope.lease_owner).await;
    record_terminal(ctx, item.task_id, config.routing_key, &envelope, TaskStatus::Failed, Some("cancelled".to_string())).await;
    let _ = ctx.queue.ack(&item).await;
    ctx.cancellation.clear(item.task_id).await;
    send_completion(ctx, item.task_id, config.routing_key, TaskOutcome::Cancelled).await;
}

async fn handle_failure(ctx: &Arc<WorkerContext>, config: &WorkerPoolConfig, item: QueueItem, envelope: TaskEnvelope, error: ExecutorError) {
    let _ = ctx.cache.release(&envelope.fingerprint, envelope.lease_owner).await;

    let exhausted = item.attempt_count >= config.retry_limit;
    if !exhausted {
        // §4.2 "transient task failure... retried up to the per-routing-key
        // maximum" and "reported task failure... retried up to the maximum
        // for QC". Both paths redeliver identically here; only the
        // terminal kind recorded once retries are exhausted differs.
        let _ = ctx.queue.nack(&item).await;
        bump_attempt_count(ctx, item.task_id, &envelope, error.public_message()).await;
        return;
    }

    record_terminal(ctx, item.task_id, config.routing_key, &envelope, TaskStatus::Failed, Some(error.public_message())).await;
    let _ = ctx.queue.ack(&item).await;
    send_completion(
        ctx,
        item.task_id,
        config.routing_key,
        TaskOutcome::Failed {
            kind: error.kind(),
            message: error.public_message(),
        },
    )
    .await;
}

async fn send_completion(ctx: &Arc<WorkerContext>, task_id: Uuid, routing_key: RoutingKey, outcome: TaskOutcome) {
    let completion = TaskCompletion { task_id, routing_key, outcome };
    if ctx.completions.send(completion).await.is_err() {
        tracing::warn!(%task_id, "completion channel closed, orchestrator may have shut down");
    }
}

fn task_key(task_id: Uuid) -> String {
    format!("task/{task_id}")
}

async fn load_task_record(ctx: &Arc<WorkerContext>, task_id: Uuid) -> Option<TaskRecord> {
    let raw = ctx.store.get(&task_key(task_id)).await.ok().flatten()?;
    serde_json::from_slice(&raw).ok()
}

async fn record_terminal(
    ctx: &Arc<WorkerContext>,
    task_id: Uuid,
    routing_key: RoutingKey,
    envelope: &TaskEnvelope,
    status: TaskStatus,
    error: Option<String>,
) {
    let mut record = load_task_record(ctx, task_id).await.unwrap_or_else(|| {
        TaskRecord::new(envelope.fingerprint.clone(), routing_key, envelope.input.clone())
    });
    record.status = status;
    record.last_error = error;
    if status == TaskStatus::Succeeded {
        record.result_ref = Some(format!("cache/{}", envelope.fingerprint));
    }
    if let Ok(bytes) = serde_json::to_vec(&record) {
        let _ = ctx.store.put(&task_key(task_id), &bytes).await;
    }
}

async fn bump_attempt_count(ctx: &Arc<WorkerContext>, task_id: Uuid, envelope: &TaskEnvelope, last_error: String) {
    if let Some(mut record) = load_task_record(ctx, task_id).await {
        record.attempt_count += 1;
        record.last_error = Some(last_error);
        if let Ok(bytes) = serde_json::to_vec(&record) {
            let _ = ctx.store.put(&task_key(task_id), &bytes).await;
        }
    }
}
