//! CLI error type and the exit-code mapping from §6.4: `0` success, `2`
//! user error, `3` coordinator unreachable, `4` submission errored, `5`
//! cancelled.

use bespoke_client::ClientError;

pub(crate) type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub(crate) enum CliError {
    /// Bad flags, bad JSON, unknown template — exit code 2.
    UserError(String),
    /// The coordinator could not be reached at all — exit code 3.
    Unreachable(String),
    /// A submission the CLI was waiting on reached `errored` — exit code 4.
    SubmissionErrored(String),
    /// A submission the CLI was waiting on reached `cancelled` — exit code 5.
    SubmissionCancelled,
}

impl CliError {
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            CliError::UserError(_) => 2,
            CliError::Unreachable(_) => 3,
            CliError::SubmissionErrored(_) => 4,
            CliError::SubmissionCancelled => 5,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::UserError(msg) => write!(f, "{msg}"),
            CliError::Unreachable(msg) => write!(f, "coordinator unreachable: {msg}"),
            CliError::SubmissionErrored(msg) => write!(f, "submission errored: {msg}"),
            CliError::SubmissionCancelled => write!(f, "submission was cancelled"),
        }
    }
}

impl From<ClientError> for CliError {
    fn from(err: ClientError) -> Self {
        match &err {
            ClientError::HttpError(e) if e.is_connect() || e.is_timeout() => CliError::Unreachable(err.to_string()),
            ClientError::ServiceUnavailable(_) | ClientError::Timeout { .. } => CliError::Unreachable(err.to_string()),
            ClientError::SubmissionNotFound { .. } | ClientError::InvalidInput(_) | ClientError::ApiError { .. } => {
                CliError::UserError(err.to_string())
            }
            _ => CliError::UserError(err.to_string()),
        }
    }
}
