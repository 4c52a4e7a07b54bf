//! The Task Queue contract (§4.5): FIFO per routing key, at-least-once
//! delivery, visibility timeout, explicit ack/nack, bounded retries. Two
//! backends implement this trait — `EmbeddedQueue` in `bespoke-worker`
//! for single-host deployments, `PgmqQueue` in `bespoke-pgmq` for
//! multi-host — so the orchestrator and worker pools depend only on the
//! trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::RoutingKey;
use crate::error::ExecutorResult;

/// One item handed to a worker on claim, carrying everything it needs to
/// ack, nack, or extend its visibility window (§3 "Queue Item").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Backend-specific handle (PGMQ `msg_id`, or a sequence number for
    /// the embedded backend) opaque to callers beyond round-tripping it
    /// back into `ack`/`nack`/`extend_visibility`.
    pub handle: String,
    pub task_id: Uuid,
    pub routing_key: RoutingKey,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
}

/// The payload shape an Orchestrator enqueues and a Worker Pool decodes
/// (§4.2 step 3, §4.4 step 1): carries everything a worker needs to
/// heartbeat its cache lease and publish a result without consulting the
/// orchestrator mid-flight. `lease_owner` is the fingerprint's lease owner
/// established by the orchestrator's `CacheManager::acquire` call — by
/// convention the task id itself, so no separate id needs threading through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub fingerprint: String,
    pub lease_owner: Uuid,
    pub input: serde_json::Value,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Durably enqueue one item of work. Returns once the item would
    /// survive a process restart (§4.5 "enqueue is durable").
    async fn enqueue(&self, routing_key: RoutingKey, task_id: Uuid, payload: serde_json::Value) -> ExecutorResult<()>;

    /// Claim up to `limit` items for `routing_key`, making them invisible
    /// to other claimants for `visibility_timeout_secs`. Strict FIFO
    /// within one routing key; no ordering across keys.
    async fn claim(
        &self,
        routing_key: RoutingKey,
        visibility_timeout_secs: u64,
        limit: usize,
    ) -> ExecutorResult<Vec<QueueItem>>;

    /// Acknowledge successful processing, permanently removing the item.
    async fn ack(&self, item: &QueueItem) -> ExecutorResult<()>;

    /// Negative-acknowledge: make the item immediately visible again for
    /// another claimant, incrementing its attempt count.
    async fn nack(&self, item: &QueueItem) -> ExecutorResult<()>;

    /// Extend an in-flight item's visibility deadline, used by a worker
    /// still making progress past its original claim window.
    async fn extend_visibility(&self, item: &QueueItem, additional_secs: u64) -> ExecutorResult<()>;
}
