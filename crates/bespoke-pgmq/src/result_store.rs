//! [`bespoke_shared::ResultStore`] over a Postgres table, for deployments
//! that already run Postgres for [`crate::PgmqQueue`] and would rather not
//! operate a second storage system for the file-backed default (§4.6).
//! Guarded by the same `CircuitBreaker` pattern as [`crate::queue::PgmqQueue`].

use std::time::Instant;

use async_trait::async_trait;
use bespoke_shared::error::{ExecutorError, ExecutorResult};
use bespoke_shared::resilience::{CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig};
use bespoke_shared::store::ResultStore;
use sqlx::{PgPool, Row};

/// Key-value table plus a named-sequence table, both created on
/// [`Self::connect`] if absent.
pub struct PostgresResultStore {
    pool: PgPool,
    breaker: CircuitBreaker,
}

impl PostgresResultStore {
    pub async fn connect(database_url: &str) -> ExecutorResult<Self> {
        let pool = PgPool::connect(database_url).await.map_err(ExecutorError::internal)?;
        Self::new_with_pool(pool).await
    }

    pub async fn new_with_pool(pool: PgPool) -> ExecutorResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bespoke_result_store (
                key TEXT PRIMARY KEY,
                value BYTEA NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(ExecutorError::internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bespoke_result_store_seq (
                name TEXT PRIMARY KEY,
                value BIGINT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(ExecutorError::internal)?;

        Ok(Self {
            pool,
            breaker: CircuitBreaker::new("postgres-result-store".to_string(), CircuitBreakerConfig::default()),
        })
    }

    fn check_breaker(&self) -> ExecutorResult<()> {
        if !self.breaker.should_allow() {
            return Err(ExecutorError::QueueUnavailable(format!(
                "{} circuit breaker is open",
                self.breaker.name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    async fn put(&self, key: &str, value: &[u8]) -> ExecutorResult<()> {
        self.check_breaker()?;
        let start = Instant::now();
        let outcome = sqlx::query(
            "INSERT INTO bespoke_result_store (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(_) => {
                self.breaker.record_success(start.elapsed());
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::internal(e))
            }
        }
    }

    async fn get(&self, key: &str) -> ExecutorResult<Option<Vec<u8>>> {
        self.check_breaker()?;
        let start = Instant::now();
        let outcome = sqlx::query("SELECT value FROM bespoke_result_store WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await;

        match outcome {
            Ok(row) => {
                self.breaker.record_success(start.elapsed());
                Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
            }
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::internal(e))
            }
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> ExecutorResult<bool> {
        self.check_breaker()?;
        let start = Instant::now();
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                return Err(ExecutorError::internal(e));
            }
        };

        let result = async {
            let current: Option<Vec<u8>> =
                sqlx::query("SELECT value FROM bespoke_result_store WHERE key = $1 FOR UPDATE")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await?
                    .map(|r| r.get::<Vec<u8>, _>("value"));

            let matches = match (&current, expected) {
                (None, None) => true,
                (Some(c), Some(e)) => c.as_slice() == e,
                _ => false,
            };
            if !matches {
                return Ok::<bool, sqlx::Error>(false);
            }

            sqlx::query(
                "INSERT INTO bespoke_result_store (key, value) VALUES ($1, $2)
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(applied) => {
                if let Err(e) = tx.commit().await {
                    self.breaker.record_failure(start.elapsed());
                    return Err(ExecutorError::internal(e));
                }
                self.breaker.record_success(start.elapsed());
                Ok(applied)
            }
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::internal(e))
            }
        }
    }

    async fn delete(&self, key: &str) -> ExecutorResult<()> {
        self.check_breaker()?;
        let start = Instant::now();
        let outcome = sqlx::query("DELETE FROM bespoke_result_store WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await;

        match outcome {
            Ok(_) => {
                self.breaker.record_success(start.elapsed());
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::internal(e))
            }
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> ExecutorResult<Vec<String>> {
        self.check_breaker()?;
        let start = Instant::now();
        let like_pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let outcome = sqlx::query("SELECT key FROM bespoke_result_store WHERE key LIKE $1")
            .bind(like_pattern)
            .fetch_all(&self.pool)
            .await;

        match outcome {
            Ok(rows) => {
                self.breaker.record_success(start.elapsed());
                Ok(rows.into_iter().map(|r| r.get::<String, _>("key")).collect())
            }
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::internal(e))
            }
        }
    }

    async fn next_sequence(&self, name: &str) -> ExecutorResult<u64> {
        self.check_breaker()?;
        let start = Instant::now();
        let outcome = sqlx::query(
            "INSERT INTO bespoke_result_store_seq (name, value) VALUES ($1, 1)
             ON CONFLICT (name) DO UPDATE SET value = bespoke_result_store_seq.value + 1
             RETURNING value",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await;

        match outcome {
            Ok(row) => {
                self.breaker.record_success(start.elapsed());
                let value: i64 = row.get("value");
                Ok(value as u64)
            }
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::internal(e))
            }
        }
    }
}
