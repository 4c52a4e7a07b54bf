//! A thin, typed wrapper over the `pgmq` Postgres extension's SQL
//! functions (`pgmq.create`, `pgmq.send`, `pgmq.read`, `pgmq.delete`,
//! `pgmq.archive`, `pgmq.set_vt`, `pgmq.pop`, `pgmq.metrics`), keeping raw
//! SQL out of callers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::{PgmqError, Result};

/// A single row read back from `pgmq.read`/`pgmq.pop`.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub vt: DateTime<Utc>,
    pub message: Value,
}

impl PgmqMessage {
    fn from_row(row: PgRow) -> Result<Self> {
        Ok(Self {
            msg_id: row.try_get("msg_id")?,
            read_ct: row.try_get("read_ct")?,
            enqueued_at: row.try_get("enqueued_at")?,
            vt: row.try_get("vt")?,
            message: row.try_get("message")?,
        })
    }
}

/// Point-in-time depth/age metrics for one queue (`pgmq.metrics`).
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    pub queue_name: String,
    pub message_count: i64,
    pub newest_msg_age_sec: Option<i32>,
    pub oldest_msg_age_sec: Option<i32>,
    pub total_messages: i64,
}

/// Typed client over one Postgres connection pool. Cheap to clone —
/// wraps an `Arc`-backed `PgPool` internally via sqlx.
#[derive(Clone)]
pub struct PgmqClient {
    pool: PgPool,
}

impl PgmqClient {
    pub async fn new_with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn drop_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.drop_queue($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn send_json_message(&self, queue_name: &str, message: &impl Serialize) -> Result<i64> {
        self.send_message_with_delay(queue_name, message, 0).await
    }

    pub async fn send_message_with_delay(
        &self,
        queue_name: &str,
        message: &impl Serialize,
        delay_seconds: i32,
    ) -> Result<i64> {
        let payload = serde_json::to_value(message)?;
        let row = sqlx::query("SELECT * FROM pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    pub async fn read_messages(
        &self,
        queue_name: &str,
        visibility_timeout_seconds: Option<i32>,
        limit: Option<i32>,
    ) -> Result<Vec<PgmqMessage>> {
        let vt = visibility_timeout_seconds.unwrap_or(30);
        let limit = limit.unwrap_or(1);
        let rows = sqlx::query("SELECT * FROM pgmq.read($1, $2, $3)")
            .bind(queue_name)
            .bind(vt)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PgmqMessage::from_row).collect()
    }

    /// Read a single specific message and deserialize its payload into
    /// `T`, the typed counterpart to [`Self::read_messages`] used when the
    /// caller already knows the exact shape expected.
    pub async fn read_specific_message<T: serde::de::DeserializeOwned>(
        &self,
        queue_name: &str,
        msg_id: i64,
    ) -> Result<Option<T>> {
        // pgmq has no read-by-id primitive; scan the visible window instead.
        let msgs = self.read_messages(queue_name, Some(0), Some(1000)).await?;
        for m in msgs {
            if m.msg_id == msg_id {
                return Ok(Some(serde_json::from_value(m.message)?));
            }
        }
        Ok(None)
    }

    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    pub async fn set_visibility_timeout(
        &self,
        queue_name: &str,
        msg_id: i64,
        vt_offset_seconds: i32,
    ) -> Result<()> {
        sqlx::query("SELECT * FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(vt_offset_seconds)
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically read-then-delete the oldest visible message, or `None`
    /// if the queue has nothing visible right now (§4.5's pop semantics).
    pub async fn pop_message(&self, queue_name: &str) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query("SELECT * FROM pgmq.pop($1)")
            .bind(queue_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PgmqMessage::from_row).transpose()
    }

    pub async fn queue_metrics(&self, queue_name: &str) -> Result<QueueMetrics> {
        let row = sqlx::query("SELECT * FROM pgmq.metrics($1)")
            .bind(queue_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(QueueMetrics {
            queue_name: row.try_get("queue_name")?,
            message_count: row.try_get("queue_length")?,
            newest_msg_age_sec: row.try_get("newest_msg_age_sec").ok(),
            oldest_msg_age_sec: row.try_get("oldest_msg_age_sec").ok(),
            total_messages: row.try_get("total_messages")?,
        })
    }

    pub async fn health_check(&self) -> Result<bool> {
        let row = sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        let one: i32 = row.try_get(0)?;
        Ok(one == 1)
    }
}
