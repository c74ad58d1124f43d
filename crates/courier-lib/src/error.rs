//! Error taxonomy for remote execution, pipeline stages and routing

use std::time::Duration;
use thiserror::Error;

/// Transport-level failure of a remote command.
///
/// A non-zero exit code is not an error; it is reported in the output.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("failed to execute `{command}` in {pod}: {message}")]
    Transport {
        pod: String,
        command: String,
        message: String,
    },

    #[error("`{command}` in {pod} timed out after {timeout:?}")]
    Timeout {
        pod: String,
        command: String,
        timeout: Duration,
    },

    #[error("no client configured for cluster context {0}")]
    UnknownContext(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("{path} not found")]
    NotFound { path: String },

    #[error("unexpected stat output for {path}: {output:?}")]
    Unparseable { path: String, output: String },

    #[error("find in {dir} failed: {stderr}")]
    Search { dir: String, stderr: String },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Failure of a compression, verification or deletion attempt.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("compressed artifact {path} missing after compression")]
    CompressedMissing { path: String },

    #[error("stage cancelled")]
    Cancelled,

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl StageError {
    /// Whether the retry policy should attempt the stage again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StageError::Cancelled)
    }
}

/// Failure of a command handler attempt.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("pod resolution failed: {0}")]
    Resolution(String),

    #[error("no pods matched {0}")]
    NoPods(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("no heartbeat within {0:?}")]
    Stalled(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Cancelled)
    }
}

/// Rejection of a command at routing time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("unsupported cluster context: {0}")]
    UnsupportedCluster(String),

    #[error("unsupported command kind: {0}")]
    UnsupportedCommandKind(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("coordinator unavailable")]
    CoordinatorUnavailable,

    #[error("queue for cluster {0} is unavailable")]
    QueueUnavailable(String),
}

impl RoutingError {
    /// Metric label for the rejection
    pub fn reason(&self) -> &'static str {
        match self {
            RoutingError::UnsupportedCluster(_) => "unsupported_cluster",
            RoutingError::UnsupportedCommandKind(_) => "unsupported_kind",
            RoutingError::InvalidCommand(_) => "invalid_command",
            RoutingError::ShuttingDown => "shutting_down",
            RoutingError::CoordinatorUnavailable => "coordinator_unavailable",
            RoutingError::QueueUnavailable(_) => "queue_unavailable",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("credential request failed: {0}")]
    Request(String),

    #[error("credential broker rejected the request: {0}")]
    Rejected(String),

    #[error("malformed credential response: {0}")]
    Malformed(String),
}

impl CredentialError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CredentialError::Request(_))
    }
}
