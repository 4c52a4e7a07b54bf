//! # Error Taxonomy
//!
//! One error enum per spec's error taxonomy (§7). `ExecutorError` is the
//! type every component boundary converges on before it reaches an HTTP
//! response or a persisted Task Record's `last_error` field — its `Display`
//! never includes the kind of internal detail an exception trace would.

use thiserror::Error;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("executor reported error: {0}")]
    ExecutorFailed(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error (ref {correlation_id})")]
    Internal {
        correlation_id: uuid::Uuid,
        #[source]
        source: anyhow::Error,
    },
}

impl ExecutorError {
    pub fn internal(source: impl Into<anyhow::Error>) -> Self {
        let correlation_id = uuid::Uuid::now_v7();
        let source = source.into();
        tracing::error!(%correlation_id, error = %source, "internal error");
        Self::Internal {
            correlation_id,
            source,
        }
    }

    /// The stable, HTTP-response-safe kind string (§7 taxonomy).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSchema(_) => "invalid-schema",
            Self::NotFound(_) => "not-found",
            Self::QueueUnavailable(_) => "queue-unavailable",
            Self::WorkerCrashed(_) => "worker-crashed",
            Self::ExecutorFailed(_) => "executor-error",
            Self::Cancelled(_) => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::Internal { .. } => "internal",
        }
    }

    /// A message safe to return across the HTTP boundary — never the
    /// `anyhow` chain backing `Internal`.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal { correlation_id, .. } => {
                format!("internal error, reference {correlation_id}")
            }
            other => other.to_string(),
        }
    }
}
