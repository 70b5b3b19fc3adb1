//! Drives one task attempt through the sandbox lifecycle.
//!
//! The supervisor owns the full arc of a single attempt: register the
//! sandbox, provision it, wait for boot, execute the agent, classify the
//! outcome, and tear the sandbox down again. It never returns an error;
//! whatever happens is folded into the [`Attempt`] it hands back, so the
//! scheduler above it only reasons about attempt outcomes.
//!
//! Two properties matter here:
//!
//! - the registry row is written *before* the backend provision call, so a
//!   crash between the two leaves a row the reconciler can find
//! - teardown runs after the drive phase no matter how it ended, including
//!   shutdown, and is itself retried before giving up

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::backend::{SandboxBackend, SandboxSpec};
use crate::config::TransienceOverrides;
use crate::error::{ExecutorError, FailureKind, LifecycleError};
use crate::executor::{RemoteExecutor, RunOutput};
use crate::fleet::retry::RetryPolicy;
use crate::lifecycle::{SandboxRecord, SandboxState};
use crate::storage::registry::{SandboxRegistry, SandboxRow};
use crate::storage::AttemptScope;
use crate::task::{Attempt, Task};

/// How much of the agent log to read back when the run ended without a
/// normal exit, matching the executor's in-memory tail.
const LOG_TAIL_BYTES: u64 = 16 * 1024;

/// Tuning for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory under which per-attempt scopes are created.
    pub work_root: PathBuf,
    /// Retry budget and backoff for the backend terminate call.
    pub teardown: RetryPolicy,
    /// Widens which backend errors count as retryable.
    pub transience: TransienceOverrides,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("sandfleet"),
            teardown: RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff_bounds_ms(500, 5_000),
            transience: TransienceOverrides::default(),
        }
    }
}

/// How the drive phase of an attempt ended, before teardown.
enum DriveOutcome {
    /// Agent ran and exited zero.
    Success(RunOutput),
    /// Agent ran and exited non-zero.
    AgentFailure(RunOutput),
    /// The infrastructure failed before or during the run.
    Infra(FailureKind, String),
    /// Shutdown interrupted the attempt.
    Aborted,
}

/// Runs single attempts end to end.
pub struct AttemptSupervisor {
    backend: Arc<dyn SandboxBackend>,
    executor: RemoteExecutor,
    registry: Arc<SandboxRegistry>,
    config: SupervisorConfig,
}

impl AttemptSupervisor {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        executor: RemoteExecutor,
        registry: Arc<SandboxRegistry>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            backend,
            executor,
            registry,
            config,
        }
    }

    /// Runs one attempt of `task`, returning its outcome.
    ///
    /// A message on `shutdown` aborts the drive phase; teardown still runs to
    /// completion so the backend resource is not leaked on cancellation.
    pub async fn run_attempt(
        &self,
        task: &Task,
        attempt_index: u32,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Attempt {
        let started_at = Utc::now();

        let mut scope = match AttemptScope::create(&self.config.work_root, task.id, attempt_index) {
            Ok(scope) => scope,
            Err(e) => {
                return Attempt::failed(
                    task.id,
                    None,
                    attempt_index,
                    started_at,
                    FailureKind::TransientInfrastructure,
                    format!("attempt workspace unavailable: {}", e),
                );
            }
        };

        let mut record = SandboxRecord::new(task.id, self.backend.kind(), attempt_index);
        info!(
            task_id = %task.id,
            sandbox_id = %record.id,
            attempt = attempt_index,
            backend = %record.backend,
            "starting sandbox attempt"
        );

        // The row must exist before the resource does, or a crash in between
        // leaves a sandbox no registry pass can discover.
        if let Err(e) = self.registry.save(&row_for(&record)).await {
            warn!(task_id = %task.id, error = %e, "registry unavailable, refusing attempt");
            return Attempt::failed(
                task.id,
                None,
                attempt_index,
                started_at,
                FailureKind::TransientInfrastructure,
                format!("sandbox registry unavailable: {}", e),
            );
        }

        let outcome = tokio::select! {
            outcome = self.drive(task, &mut record, &scope) => outcome,
            _ = shutdown.recv() => {
                info!(task_id = %task.id, sandbox_id = %record.id, "shutdown requested, aborting attempt");
                DriveOutcome::Aborted
            }
        };

        // Teardown is not cancellable; an aborted attempt still retires its
        // sandbox before the supervisor returns.
        self.teardown(&mut record).await;

        if scope.log_path().exists() {
            scope.persist();
        }

        let attempt = match outcome {
            DriveOutcome::Success(output) => Attempt::succeeded(
                task.id,
                record.id,
                attempt_index,
                started_at,
                output.exit_code,
                output.log_tail,
                output.log_path,
                output.output_path,
            ),
            DriveOutcome::AgentFailure(output) => Attempt::failed(
                task.id,
                Some(record.id),
                attempt_index,
                started_at,
                FailureKind::TaskLogicFailure,
                format!("agent exited with code {}", output.exit_code),
            )
            .with_exit_code(output.exit_code)
            .with_logs(output.log_tail, Some(output.log_path)),
            DriveOutcome::Infra(kind, message) => {
                let mut attempt = Attempt::failed(
                    task.id,
                    Some(record.id),
                    attempt_index,
                    started_at,
                    kind,
                    message,
                );
                // Timed-out runs never hand back a RunOutput, but the log
                // file on disk still has the tail.
                if scope.is_persisted() {
                    attempt = attempt.with_logs(file_tail(&scope.log_path()), Some(scope.log_path()));
                }
                attempt
            }
            DriveOutcome::Aborted => {
                Attempt::aborted(task.id, Some(record.id), attempt_index, started_at)
            }
        };

        info!(
            task_id = %task.id,
            sandbox_id = %record.id,
            attempt = attempt_index,
            status = %attempt.status,
            duration_ms = attempt.duration_ms(),
            "attempt finished"
        );
        attempt
    }

    /// Provision, boot, execute. Every exit path has already moved the
    /// record to the matching state and mirrored it to the registry.
    async fn drive(
        &self,
        task: &Task,
        record: &mut SandboxRecord,
        scope: &AttemptScope,
    ) -> DriveOutcome {
        self.advance(record, SandboxState::Provisioning).await;

        let spec = SandboxSpec::for_task(task);
        let handle = match self.backend.provision(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let kind = self.config.transience.failure_kind(&e);
                self.advance(record, SandboxState::ProvisionError).await;
                return DriveOutcome::Infra(kind, format!("provisioning failed: {}", e));
            }
        };
        info!(
            sandbox_id = %record.id,
            external_id = %handle.external_id,
            "sandbox provisioned"
        );

        record.handle = Some(handle.clone());
        self.advance(record, SandboxState::Booting).await;

        let channel = match self.backend.channel(&handle) {
            Ok(channel) => channel,
            Err(e) => {
                let kind = self.config.transience.failure_kind(&e);
                self.advance(record, SandboxState::ProvisionError).await;
                return DriveOutcome::Infra(kind, format!("channel setup failed: {}", e));
            }
        };

        match self.executor.ensure_ready(channel.as_ref()).await {
            Ok(()) => {}
            Err(ExecutorError::NotReachable { waited_secs }) => {
                self.advance(record, SandboxState::ProvisionError).await;
                let err = LifecycleError::BootTimeout {
                    seconds: waited_secs,
                };
                return DriveOutcome::Infra(FailureKind::TransientInfrastructure, err.to_string());
            }
            Err(e) => {
                let kind = e.failure_kind();
                self.advance(record, SandboxState::ProvisionError).await;
                return DriveOutcome::Infra(kind, format!("readiness probe failed: {}", e));
            }
        }
        self.advance(record, SandboxState::Ready).await;

        self.advance(record, SandboxState::Executing).await;
        match self.executor.run_task(channel.as_ref(), task, scope).await {
            Ok(output) if output.exit_code == 0 => {
                self.advance(record, SandboxState::Succeeded).await;
                DriveOutcome::Success(output)
            }
            Ok(output) => {
                self.advance(record, SandboxState::Failed).await;
                DriveOutcome::AgentFailure(output)
            }
            Err(e) => {
                let kind = e.failure_kind();
                self.advance(record, SandboxState::Failed).await;
                DriveOutcome::Infra(kind, e.to_string())
            }
        }
    }

    /// Retires the sandbox behind `record`, retrying transient failures.
    ///
    /// On exhaustion the row is left in `tearing_down` so the next
    /// reconciliation pass picks the resource up.
    async fn teardown(&self, record: &mut SandboxRecord) {
        if record.state.is_terminal() {
            return;
        }

        let external_id = match record.handle.as_ref() {
            Some(handle) => handle.external_id.clone(),
            None => {
                // No handle was recorded, so only the row is retired here.
                // A resource created without one carries the managed label
                // and falls to the reconciliation sweep.
                self.advance(record, SandboxState::TearingDown).await;
                self.advance(record, SandboxState::Terminated).await;
                return;
            }
        };

        self.advance(record, SandboxState::TearingDown).await;

        let policy = self.config.teardown;
        let mut attempt = 1u32;
        loop {
            match self.backend.terminate(&external_id).await {
                Ok(()) => {
                    self.advance(record, SandboxState::Terminated).await;
                    info!(
                        sandbox_id = %record.id,
                        external_id = %external_id,
                        "sandbox terminated"
                    );
                    return;
                }
                Err(e) if self.config.transience.is_transient(&e) && policy.allows_another(attempt) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        sandbox_id = %record.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "teardown failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        sandbox_id = %record.id,
                        external_id = %external_id,
                        error = %e,
                        "teardown exhausted, leaving sandbox for reconciliation"
                    );
                    return;
                }
            }
        }
    }

    /// Moves the record forward and mirrors the new state to the registry.
    ///
    /// Registry writes after the initial insert are best effort: losing one
    /// costs reconciliation accuracy, not correctness of the attempt.
    async fn advance(&self, record: &mut SandboxRecord, next: SandboxState) {
        if let Err(e) = record.transition(next) {
            // Drive-path transitions are legal by construction.
            error!(sandbox_id = %record.id, error = %e, "lifecycle bookkeeping error");
            return;
        }
        if let Err(e) = self.registry.save(&row_for(record)).await {
            warn!(
                sandbox_id = %record.id,
                state = %record.state,
                error = %e,
                "registry write failed"
            );
        }
    }
}

fn row_for(record: &SandboxRecord) -> SandboxRow {
    SandboxRow::new(record.id, record.task_id, record.backend, record.state)
        .with_external_id(record.external_id())
        .with_attempt(record.attempt)
}

/// Reads the last chunk of a log file, lossily decoded.
fn file_tail(path: &Path) -> String {
    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if file.seek(SeekFrom::Start(len.saturating_sub(LOG_TAIL_BYTES))).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}
