//! Client error types (§7).

use thiserror::Error;

/// Client operation result type.
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, kind: String, message: String },

    #[error("Submission not found: {id}")]
    SubmissionNotFound { id: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Coordinator unreachable: {0}")]
    ServiceUnavailable(String),

    #[error("Timeout waiting for operation: {operation}")]
    Timeout { operation: String },

    #[error("Invalid response: {field} - {reason}")]
    InvalidResponse { field: String, reason: String },
}

impl ClientError {
    pub fn api_error(status: u16, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ApiError { status, kind: kind.into(), message: message.into() }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn invalid_response(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse { field: field.into(), reason: reason.into() }
    }

    /// Whether retrying the same request might succeed (§7 `queue-unavailable`,
    /// `timeout`, and 5xx API responses are all worth a retry at the client
    /// layer; everything else reflects a request the server will reject again).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::HttpError(e) => e.is_timeout() || e.is_connect(),
            ClientError::ServiceUnavailable(_) => true,
            ClientError::Timeout { .. } => true,
            ClientError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_500_is_recoverable() {
        let err = ClientError::api_error(500, "internal", "boom");
        assert!(err.is_recoverable());
    }

    #[test]
    fn api_error_400_is_not_recoverable() {
        let err = ClientError::api_error(400, "invalid-schema", "bad workflow");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn display_api_error() {
        let err = ClientError::api_error(404, "not-found", "no such submission");
        assert_eq!(format!("{err}"), "API error: 404 - no such submission");
    }
}
