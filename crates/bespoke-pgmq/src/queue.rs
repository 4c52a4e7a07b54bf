//! [`bespoke_shared::TaskQueue`] over the PGMQ client, the multi-host
//! backend selected when the configured queue backend URL is a
//! `postgres://` URL (§4.5). Every call is gated by a `CircuitBreaker`
//! (§2 item 10) protecting the rest of the system from a struggling
//! Postgres instance — the "messaging client protecting Task Queue calls"
//! the resilience module's doc comment describes.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use bespoke_shared::domain::RoutingKey;
use bespoke_shared::error::{ExecutorError, ExecutorResult};
use bespoke_shared::queue::{QueueItem, TaskQueue};
use bespoke_shared::resilience::{CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig};
use serde_json::json;
use uuid::Uuid;

use crate::client::PgmqClient;
use crate::error::PgmqError;

/// One PGMQ queue per routing key, named `bespoke_<key>`.
pub struct PgmqQueue {
    client: PgmqClient,
    breaker: CircuitBreaker,
}

fn queue_name(routing_key: RoutingKey) -> String {
    format!("bespoke_{}", routing_key.as_str())
}

impl PgmqQueue {
    pub async fn new(client: PgmqClient) -> ExecutorResult<Self> {
        for key in RoutingKey::ALL {
            client
                .create_queue(&queue_name(key))
                .await
                .map_err(ExecutorError::from)?;
        }
        Ok(Self {
            client,
            breaker: CircuitBreaker::new("pgmq-task-queue".to_string(), CircuitBreakerConfig::default()),
        })
    }

    /// Gates a PGMQ call behind the circuit breaker: fails fast with
    /// `queue-unavailable` while the breaker is open, otherwise records the
    /// call's outcome and duration.
    async fn guarded<T, F>(&self, call: F) -> ExecutorResult<T>
    where
        F: Future<Output = Result<T, PgmqError>>,
    {
        if !self.breaker.should_allow() {
            return Err(ExecutorError::QueueUnavailable(format!(
                "{} circuit breaker is open",
                self.breaker.name()
            )));
        }
        let start = Instant::now();
        match call.await {
            Ok(value) => {
                self.breaker.record_success(start.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::from(err))
            }
        }
    }
}

#[async_trait]
impl TaskQueue for PgmqQueue {
    async fn enqueue(
        &self,
        routing_key: RoutingKey,
        task_id: Uuid,
        payload: serde_json::Value,
    ) -> ExecutorResult<()> {
        let envelope = json!({ "task_id": task_id, "payload": payload });
        self.guarded(self.client.send_json_message(&queue_name(routing_key), &envelope)).await.map(|_| ())
    }

    async fn claim(
        &self,
        routing_key: RoutingKey,
        visibility_timeout_secs: u64,
        limit: usize,
    ) -> ExecutorResult<Vec<QueueItem>> {
        let rows = self
            .guarded(self.client.read_messages(
                &queue_name(routing_key),
                Some(visibility_timeout_secs as i32),
                Some(limit as i32),
            ))
            .await?;

        rows.into_iter()
            .map(|row| {
                let task_id = row
                    .message
                    .get("task_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| ExecutorError::InvalidSchema("queue item missing task_id".into()))?;
                let payload = row
                    .message
                    .get("payload")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                Ok(QueueItem {
                    handle: row.msg_id.to_string(),
                    task_id,
                    routing_key,
                    payload,
                    attempt_count: row.read_ct.max(0) as u32,
                })
            })
            .collect()
    }

    async fn ack(&self, item: &QueueItem) -> ExecutorResult<()> {
        let msg_id: i64 = item
            .handle
            .parse()
            .map_err(|_| ExecutorError::InvalidSchema("malformed queue handle".into()))?;
        self.guarded(self.client.delete_message(&queue_name(item.routing_key), msg_id)).await.map(|_| ())
    }

    async fn nack(&self, item: &QueueItem) -> ExecutorResult<()> {
        let msg_id: i64 = item
            .handle
            .parse()
            .map_err(|_| ExecutorError::InvalidSchema("malformed queue handle".into()))?;
        self.guarded(self.client.set_visibility_timeout(&queue_name(item.routing_key), msg_id, 0)).await
    }

    async fn extend_visibility(&self, item: &QueueItem, additional_secs: u64) -> ExecutorResult<()> {
        let msg_id: i64 = item
            .handle
            .parse()
            .map_err(|_| ExecutorError::InvalidSchema("malformed queue handle".into()))?;
        self.guarded(self.client.set_visibility_timeout(&queue_name(item.routing_key), msg_id, additional_secs as i32))
            .await
    }
}
