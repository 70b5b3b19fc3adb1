//! Error types for sandfleet operations.
//!
//! Defines error types for the major subsystems:
//! - Sandbox backends (container runtime, cloud VM provisioner)
//! - Remote execution channels
//! - Lifecycle supervision and state transitions
//! - Fleet scheduling
//!
//! Module-local concerns (sealing, storage, configuration) declare their own
//! error enums next to the code that raises them.

use thiserror::Error;

/// Final failure classification attached to every terminal task outcome.
///
/// The classification decides retry behavior: only `TransientInfrastructure`
/// and `TimeoutExceeded` re-enter the queue while the attempt budget lasts.
/// `TaskLogicFailure` is the agent's own doing and is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Infrastructure hiccup (network blip, rate limit, boot flake). Retryable.
    TransientInfrastructure,

    /// Invalid spec, auth failure, or other condition retry cannot fix.
    PermanentConfiguration,

    /// The agent or task itself failed. Terminal on first occurrence.
    TaskLogicFailure,

    /// Wall-clock budget exceeded. Retryable until the attempt budget runs out.
    TimeoutExceeded,

    /// Cryptographic sealing or integrity violation. Always fatal to the result.
    Sealing,
}

impl FailureKind {
    /// Whether another attempt could plausibly change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::TransientInfrastructure | FailureKind::TimeoutExceeded
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::TransientInfrastructure => "transient_infrastructure",
            FailureKind::PermanentConfiguration => "permanent_configuration",
            FailureKind::TaskLogicFailure => "task_logic_failure",
            FailureKind::TimeoutExceeded => "timeout_exceeded",
            FailureKind::Sealing => "sealing",
        };
        write!(f, "{}", s)
    }
}

/// Errors raised by sandbox backends (container runtime or cloud provisioner).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid sandbox spec: {0}")]
    InvalidSpec(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Sandbox '{id}' not found")]
    NotFound { id: String },

    #[error("Runtime daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Default transience classification, before configuration overrides.
    ///
    /// Mirrors common cloud SDK taxonomies: rate limits, transport faults and
    /// server-side errors are retryable; spec, auth and quota problems are not.
    /// `QuotaExceeded` and specific API codes can be reclassified through
    /// [`crate::config::HarnessConfig`].
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::RateLimited(_)
            | BackendError::Transport(_)
            | BackendError::DaemonUnavailable(_)
            | BackendError::Io(_) => true,
            BackendError::Api { code, .. } => *code >= 500,
            BackendError::ProvisionFailed(_)
            | BackendError::QuotaExceeded(_)
            | BackendError::InvalidSpec(_)
            | BackendError::AuthFailed(_)
            | BackendError::NotFound { .. } => false,
        }
    }

    /// Map this error into the terminal failure taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        if self.is_transient() {
            FailureKind::TransientInfrastructure
        } else {
            FailureKind::PermanentConfiguration
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err.to_string())
    }
}

/// Errors raised while executing a task inside a booted sandbox.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Sandbox not reachable after {waited_secs}s of readiness polling")]
    NotReachable { waited_secs: u64 },

    #[error("Payload upload failed: {0}")]
    UploadFailed(String),

    #[error("Execution channel closed unexpectedly: {0}")]
    ChannelClosed(String),

    #[error("Task execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Remote kill failed: {0}")]
    KillFailed(String),

    #[error("Artifact download failed: {0}")]
    DownloadFailed(String),

    #[error("Channel protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExecutorError {
    /// Executor faults are infrastructure faults except the wall-clock
    /// timeout, which carries its own classification.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ExecutorError::Timeout { .. } => FailureKind::TimeoutExceeded,
            _ => FailureKind::TransientInfrastructure,
        }
    }
}

/// Errors raised by the lifecycle state machine and its supervisor.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Illegal state transition from '{from}' to '{to}'")]
    IllegalTransition { from: String, to: String },

    #[error("Sandbox boot timed out after {seconds} seconds")]
    BootTimeout { seconds: u64 },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Registry error: {0}")]
    Registry(String),
}

/// Errors raised by the fleet scheduler itself.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is shutting down; task not accepted")]
    ShuttingDown,

    #[error("No tasks submitted")]
    EmptySubmission,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_are_retryable() {
        assert!(FailureKind::TransientInfrastructure.is_retryable());
        assert!(FailureKind::TimeoutExceeded.is_retryable());
        assert!(!FailureKind::PermanentConfiguration.is_retryable());
        assert!(!FailureKind::TaskLogicFailure.is_retryable());
        assert!(!FailureKind::Sealing.is_retryable());
    }

    #[test]
    fn backend_transience_defaults() {
        assert!(BackendError::RateLimited("429".into()).is_transient());
        assert!(BackendError::Transport("reset".into()).is_transient());
        assert!(BackendError::DaemonUnavailable("socket".into()).is_transient());
        assert!(BackendError::Api {
            code: 503,
            message: "unavailable".into()
        }
        .is_transient());

        assert!(!BackendError::InvalidSpec("bad image".into()).is_transient());
        assert!(!BackendError::AuthFailed("expired".into()).is_transient());
        assert!(!BackendError::QuotaExceeded("cpus".into()).is_transient());
        assert!(!BackendError::Api {
            code: 422,
            message: "unprocessable".into()
        }
        .is_transient());
    }

    #[test]
    fn executor_timeout_maps_to_timeout_kind() {
        let err = ExecutorError::Timeout { seconds: 30 };
        assert_eq!(err.failure_kind(), FailureKind::TimeoutExceeded);

        let err = ExecutorError::UploadFailed("tar".into());
        assert_eq!(err.failure_kind(), FailureKind::TransientInfrastructure);
    }

    #[test]
    fn failure_kind_display_is_snake_case() {
        assert_eq!(
            FailureKind::TransientInfrastructure.to_string(),
            "transient_infrastructure"
        );
        assert_eq!(FailureKind::Sealing.to_string(), "sealing");
    }
}
