//! Queue-layer error taxonomy. Converts to [`bespoke_shared::ExecutorError`]
//! at the Task Queue trait boundary so callers only ever see one kind of
//! error regardless of which backend is configured.

use bespoke_shared::ExecutorError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PgmqError>;

#[derive(Debug, Error)]
pub enum PgmqError {
    #[error("pgmq database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    #[error("message payload is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<PgmqError> for ExecutorError {
    fn from(err: PgmqError) -> Self {
        match err {
            PgmqError::QueueNotFound(name) => ExecutorError::NotFound(format!("queue {name}")),
            other => ExecutorError::QueueUnavailable(other.to_string()),
        }
    }
}
