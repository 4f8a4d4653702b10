use thiserror::Error;
use tracing::error;

/// Transport, adapter and session failures. These never reach the AI; they end up in logs and,
/// for leg failures, as the close reason of a session.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AppError(pub &'static str);

/// Failures talking to the scheduling store. Every variant is retryable from the caller's
/// point of view and counts toward the consecutive backend failure limit of a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepoError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("repository call timed out")]
    Timeout,
    #[error("repository query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                RepoError::Unavailable(e.to_string())
            }
            sqlx::Error::Io(io) => RepoError::Unavailable(io.to_string()),
            other => RepoError::Query(other.to_string()),
        }
    }
}

/// Errors raised while handling a single tool call. They are converted into structured tool
/// results for the AI to speak, never propagated to the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    Validation(String),
    #[error("`{tool}` is not allowed while the workflow is {state}")]
    InvalidState { tool: &'static str, state: &'static str },
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error(transparent)]
    Backend(#[from] RepoError),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation",
            ToolError::InvalidState { .. } => "invalid_state",
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::Backend(RepoError::Timeout) => "timeout",
            ToolError::Backend(_) => "backend_unavailable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Backend(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("{key} has an invalid value `{value}`")]
    Invalid { key: &'static str, value: String },
}

pub async fn handle_error(e: impl std::error::Error) {
    error!("ERROR: {e}")
}
