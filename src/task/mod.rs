//! Task, attempt and result definitions for the fleet.
//!
//! This module defines the records that flow through the orchestrator:
//!
//! - `Task`: an immutable unit of benchmark work submitted to the fleet
//! - `ResourceRequest`: resource requirements attached to a task
//! - `Attempt`: one execution of a task inside one sandbox, frozen on creation
//! - `TaskResult`: the single terminal outcome produced per task
//!
//! Tasks, sandboxes and attempts reference each other by identifier only, so
//! records stay freely clonable and serializable with no ownership cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;

/// Default per-task wall-clock deadline in seconds.
const DEFAULT_DEADLINE_SECONDS: u64 = 1800;

/// Default sandbox memory limit in bytes (2 GiB).
const DEFAULT_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default CPU allotment in millicores.
const DEFAULT_CPU_MILLIS: u64 = 2000;

/// Default cap on processes inside a sandbox.
const DEFAULT_PIDS_LIMIT: u32 = 512;

/// Resource requirements for the sandbox a task runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    /// CPU allotment in millicores (1000 = one core).
    pub cpu_millis: u64,
    /// Maximum number of processes.
    pub pids_limit: u32,
    /// Disk hint in bytes, advisory for VM sizing.
    #[serde(default)]
    pub disk_bytes: Option<u64>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            cpu_millis: DEFAULT_CPU_MILLIS,
            pids_limit: DEFAULT_PIDS_LIMIT,
            disk_bytes: None,
        }
    }
}

impl ResourceRequest {
    /// Sets the memory limit in bytes.
    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    /// Sets the CPU allotment in millicores.
    pub fn with_cpu_millis(mut self, millis: u64) -> Self {
        self.cpu_millis = millis;
        self
    }

    /// Sets the process cap.
    pub fn with_pids_limit(mut self, limit: u32) -> Self {
        self.pids_limit = limit;
        self
    }

    /// Sets the disk hint in bytes.
    pub fn with_disk_bytes(mut self, bytes: u64) -> Self {
        self.disk_bytes = Some(bytes);
        self
    }
}

/// Agent configuration carried opaquely into the sandbox.
///
/// The harness does not interpret benchmark semantics; it only knows how to
/// start the entry point and which environment to hand it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Command line invoked inside the sandbox to start the agent.
    pub entry_point: Vec<String>,
    /// Container image or VM image reference the sandbox boots from.
    pub image: String,
    /// Environment variables handed to the entry point.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl AgentConfig {
    /// Creates an agent configuration from an image and entry point.
    pub fn new(image: impl Into<String>, entry_point: Vec<String>) -> Self {
        Self {
            entry_point,
            image: image.into(),
            env: Vec::new(),
        }
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A unit of benchmark work submitted to the fleet.
///
/// Tasks are immutable once enqueued: all fields are set at construction and
/// the scheduler never writes back into them. Retry bookkeeping lives in the
/// scheduler's queue entries, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: Uuid,
    /// Opaque benchmark reference (suite + case), uninterpreted by the harness.
    pub benchmark: String,
    /// Agent configuration to run inside the sandbox.
    pub agent: AgentConfig,
    /// Resource requirements for the sandbox.
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Wall-clock deadline in seconds for a single attempt.
    pub deadline_seconds: u64,
    /// When this task was created.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a task with a fresh id and default resources and deadline.
    pub fn new(benchmark: impl Into<String>, agent: AgentConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            benchmark: benchmark.into(),
            agent,
            resources: ResourceRequest::default(),
            deadline_seconds: DEFAULT_DEADLINE_SECONDS,
            created_at: Utc::now(),
        }
    }

    /// Sets the resource requirements.
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the per-attempt wall-clock deadline in seconds.
    pub fn with_deadline_seconds(mut self, seconds: u64) -> Self {
        self.deadline_seconds = seconds;
        self
    }
}

/// Terminal status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// The agent ran to completion with a zero exit status.
    Succeeded,
    /// The agent or the infrastructure around it failed.
    Failed,
    /// The per-attempt wall clock expired and the agent was killed.
    TimedOut,
    /// The attempt was cancelled by a shutdown signal.
    Aborted,
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptStatus::Succeeded => write!(f, "succeeded"),
            AttemptStatus::Failed => write!(f, "failed"),
            AttemptStatus::TimedOut => write!(f, "timed_out"),
            AttemptStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// One execution of a task inside one sandbox.
///
/// Attempts are constructed already terminal and never mutated afterwards; a
/// retry creates a new attempt with the next index rather than rewriting an
/// old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// Unique identifier for this attempt.
    pub id: Uuid,
    /// Task this attempt belongs to.
    pub task_id: Uuid,
    /// Sandbox the attempt ran in, if provisioning got that far.
    pub sandbox_id: Option<Uuid>,
    /// 1-based position in the task's attempt history.
    pub index: u32,
    /// When supervision of this attempt began.
    pub started_at: DateTime<Utc>,
    /// When the attempt reached its terminal status.
    pub finished_at: DateTime<Utc>,
    /// Terminal status.
    pub status: AttemptStatus,
    /// Exit code reported by the entry point, when one was observed.
    pub exit_code: Option<i64>,
    /// Failure classification for non-succeeded attempts.
    pub failure: Option<FailureKind>,
    /// Human-readable error for non-succeeded attempts.
    pub error: Option<String>,
    /// Bounded tail of the combined stdout/stderr stream.
    pub log_tail: String,
    /// Path to the full attempt log on disk, when persisted.
    pub log_path: Option<std::path::PathBuf>,
    /// Path to the downloaded output directory, when persisted.
    pub output_path: Option<std::path::PathBuf>,
}

impl Attempt {
    /// Creates a successful attempt record.
    #[allow(clippy::too_many_arguments)]
    pub fn succeeded(
        task_id: Uuid,
        sandbox_id: Uuid,
        index: u32,
        started_at: DateTime<Utc>,
        exit_code: i64,
        log_tail: String,
        log_path: std::path::PathBuf,
        output_path: std::path::PathBuf,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            sandbox_id: Some(sandbox_id),
            index,
            started_at,
            finished_at: Utc::now(),
            status: AttemptStatus::Succeeded,
            exit_code: Some(exit_code),
            failure: None,
            error: None,
            log_tail,
            log_path: Some(log_path),
            output_path: Some(output_path),
        }
    }

    /// Creates a failed attempt record with its classification.
    pub fn failed(
        task_id: Uuid,
        sandbox_id: Option<Uuid>,
        index: u32,
        started_at: DateTime<Utc>,
        failure: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        let status = match failure {
            FailureKind::TimeoutExceeded => AttemptStatus::TimedOut,
            _ => AttemptStatus::Failed,
        };
        Self {
            id: Uuid::new_v4(),
            task_id,
            sandbox_id,
            index,
            started_at,
            finished_at: Utc::now(),
            status,
            exit_code: None,
            failure: Some(failure),
            error: Some(error.into()),
            log_tail: String::new(),
            log_path: None,
            output_path: None,
        }
    }

    /// Creates an aborted attempt record for shutdown cancellation.
    pub fn aborted(
        task_id: Uuid,
        sandbox_id: Option<Uuid>,
        index: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            sandbox_id,
            index,
            started_at,
            finished_at: Utc::now(),
            status: AttemptStatus::Aborted,
            exit_code: None,
            failure: None,
            error: Some("attempt aborted by shutdown".to_string()),
            log_tail: String::new(),
            log_path: None,
            output_path: None,
        }
    }

    /// Attaches captured log data to a non-succeeded attempt.
    ///
    /// Used when an attempt failed after logs started flowing, so the record
    /// still carries whatever output the agent produced.
    pub fn with_logs(mut self, log_tail: String, log_path: Option<std::path::PathBuf>) -> Self {
        self.log_tail = log_tail;
        self.log_path = log_path;
        self
    }

    /// Attaches an observed exit code to a non-succeeded attempt.
    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Whether the attempt's failure class permits another attempt.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            AttemptStatus::Succeeded | AttemptStatus::Aborted => false,
            AttemptStatus::Failed | AttemptStatus::TimedOut => self
                .failure
                .map(|kind| kind.is_retryable())
                .unwrap_or(false),
        }
    }

    /// Duration of the attempt in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Terminal status of a task as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Some attempt succeeded.
    Succeeded,
    /// Every permitted attempt failed.
    Failed,
    /// Shutdown arrived before a natural terminal state.
    Aborted,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// The single terminal outcome produced for each submitted task.
///
/// Carries the full attempt history so callers can see retries without ever
/// receiving raw infrastructure errors mid-flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task this result belongs to.
    pub task_id: Uuid,
    /// Terminal status.
    pub status: TaskStatus,
    /// Every attempt made, in order.
    pub attempts: Vec<Attempt>,
    /// Classification of the final failure, absent on success.
    pub failure: Option<FailureKind>,
    /// Human-readable error for failed or aborted tasks.
    pub error: Option<String>,
    /// Where the sealed result envelope was written, when sealing ran.
    #[serde(default)]
    pub sealed_path: Option<std::path::PathBuf>,
    /// When the terminal status was reached.
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Creates a successful result from an attempt history ending in success.
    pub fn success(task_id: Uuid, attempts: Vec<Attempt>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Succeeded,
            attempts,
            failure: None,
            error: None,
            sealed_path: None,
            completed_at: Utc::now(),
        }
    }

    /// Creates a failed result carrying the final classification.
    pub fn failure(
        task_id: Uuid,
        attempts: Vec<Attempt>,
        failure: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            attempts,
            failure: Some(failure),
            error: Some(error.into()),
            sealed_path: None,
            completed_at: Utc::now(),
        }
    }

    /// Creates an aborted result for tasks cancelled by shutdown.
    pub fn aborted(task_id: Uuid, attempts: Vec<Attempt>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Aborted,
            attempts,
            failure: None,
            error: Some("task aborted by shutdown".to_string()),
            sealed_path: None,
            completed_at: Utc::now(),
        }
    }

    /// Records where the sealed envelope for this result was written.
    pub fn with_sealed_path(mut self, path: std::path::PathBuf) -> Self {
        self.sealed_path = Some(path);
        self
    }

    /// Number of attempts made for this task.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Whether the task succeeded.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    /// The final attempt, if any were made.
    pub fn final_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}
