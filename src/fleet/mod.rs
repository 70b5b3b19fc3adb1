//! Fleet scheduling: a bounded pool of workers running task attempts.
//!
//! The scheduler turns a batch of tasks into a stream of terminal results.
//! Each worker owns at most one live sandbox, so the pool size is the hard
//! cap on concurrent sandboxes. Retryable failures go back into the shared
//! [`TaskQueue`] with a backoff deadline instead of holding a worker, and
//! every submitted task reports exactly one [`TaskResult`], shutdown
//! included.
//!
//! # Modules
//!
//! - [`queue`]: the in-memory delay queue workers pull from
//! - [`retry`]: attempt budget and backoff timing

pub mod queue;
pub mod retry;

pub use queue::{QueuedTask, TaskQueue};
pub use retry::RetryPolicy;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, SchedulerError};
use crate::lifecycle::AttemptSupervisor;
use crate::seal::{self, ResultBundle, SealKey};
use crate::task::{AttemptStatus, Task, TaskResult, TaskStatus};

/// Configuration for a fleet run.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Hard cap on sandboxes alive at once; also the worker count.
    pub max_concurrent_sandboxes: usize,
    /// Attempt budget and backoff timing for transient failures.
    pub retry: RetryPolicy,
    /// Root directory attempts persist under; sealing reads from here.
    pub work_root: PathBuf,
    /// Key used to seal result bundles. `None` disables sealing.
    pub seal_key: Option<SealKey>,
    /// Directory sealed envelopes are written to as `<task-id>.sealed.json`.
    /// `None` keeps envelopes next to the attempt artifacts.
    pub seal_output_dir: Option<PathBuf>,
    /// How long an idle worker waits before re-checking the queue.
    pub poll_interval: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sandboxes: 4,
            retry: RetryPolicy::default(),
            work_root: std::env::temp_dir().join("sandfleet"),
            seal_key: None,
            seal_output_dir: None,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl FleetConfig {
    /// Creates a configuration with the given sandbox cap.
    pub fn new(max_concurrent_sandboxes: usize) -> Self {
        Self {
            max_concurrent_sandboxes: max_concurrent_sandboxes.max(1),
            ..Default::default()
        }
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the work root attempts persist under.
    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.work_root = work_root.into();
        self
    }

    /// Enables sealing of result bundles with the given key.
    pub fn with_seal_key(mut self, key: SealKey) -> Self {
        self.seal_key = Some(key);
        self
    }

    /// Collects sealed envelopes under one directory instead of the
    /// per-attempt artifact tree.
    pub fn with_seal_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.seal_output_dir = Some(dir.into());
        self
    }

    /// Sets the idle-worker poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Snapshot of fleet counters.
#[derive(Debug, Clone, Default)]
pub struct FleetStats {
    /// Configured sandbox cap.
    pub max_concurrent: usize,
    /// Attempts currently running in a sandbox.
    pub active_sandboxes: usize,
    /// Tasks that finished with a success.
    pub tasks_succeeded: u64,
    /// Tasks that exhausted their options and failed.
    pub tasks_failed: u64,
    /// Tasks cut short by shutdown.
    pub tasks_aborted: u64,
    /// Attempts re-enqueued after a retryable failure.
    pub retries: u64,
}

impl FleetStats {
    /// Total tasks that reached a terminal result.
    pub fn total_finished(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed + self.tasks_aborted
    }

    /// Success rate as a percentage of finished tasks.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_finished();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared counters the workers update.
struct SharedFleetStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    retries: AtomicU64,
    active: AtomicU64,
}

impl SharedFleetStats {
    fn new() -> Self {
        Self {
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            active: AtomicU64::new(0),
        }
    }

    fn record(&self, result: &TaskResult) {
        let counter = match result.status {
            TaskStatus::Succeeded => &self.succeeded,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self, max_concurrent: usize) -> FleetStats {
        FleetStats {
            max_concurrent,
            active_sandboxes: self.active.load(Ordering::SeqCst) as usize,
            tasks_succeeded: self.succeeded.load(Ordering::SeqCst),
            tasks_failed: self.failed.load(Ordering::SeqCst),
            tasks_aborted: self.aborted.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
        }
    }
}

/// Schedules task attempts over a bounded pool of sandbox workers.
pub struct FleetScheduler {
    config: FleetConfig,
    supervisor: Arc<AttemptSupervisor>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    stats: Arc<SharedFleetStats>,
}

impl FleetScheduler {
    /// Creates a scheduler around a configured supervisor.
    pub fn new(supervisor: AttemptSupervisor, config: FleetConfig) -> Self {
        // One message total: every receiver sees the single shutdown signal.
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            supervisor: Arc::new(supervisor),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
            stats: Arc::new(SharedFleetStats::new()),
        }
    }

    /// Sender half of the shutdown signal; hand a clone to a signal handler.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Broadcasts shutdown to every worker and in-flight attempt.
    ///
    /// The scheduler refuses new submissions afterwards.
    pub fn shutdown(&self) {
        info!("fleet shutdown requested");
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Current counters.
    pub fn stats(&self) -> FleetStats {
        self.stats.snapshot(self.config.max_concurrent_sandboxes)
    }

    /// Starts processing `tasks`, returning results in completion order.
    ///
    /// The stream yields exactly one result per submitted task and then
    /// ends. Dropping the stream does not stop the fleet; use
    /// [`shutdown`](Self::shutdown) for that.
    pub fn submit(
        &self,
        tasks: Vec<Task>,
    ) -> Result<ReceiverStream<TaskResult>, SchedulerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        if tasks.is_empty() {
            return Err(SchedulerError::EmptySubmission);
        }

        let total = tasks.len();
        let workers = self.config.max_concurrent_sandboxes.clamp(1, total);
        info!(
            tasks = total,
            max_concurrent = workers,
            sealing = self.config.seal_key.is_some(),
            "fleet run starting"
        );

        let queue = Arc::new(TaskQueue::new(tasks));
        let (tx, rx) = mpsc::channel(total);

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let worker = FleetWorker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&queue),
                supervisor: Arc::clone(&self.supervisor),
                results: tx.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                retry: self.config.retry,
                seal_key: self.config.seal_key.clone(),
                seal_output_dir: self.config.seal_output_dir.clone(),
                work_root: self.config.work_root.clone(),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
                shutting_down: false,
            };
            handles.push(tokio::spawn(worker.run()));
        }

        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "fleet worker panicked");
                }
            }
            // Tasks still queued when the workers stop never ran; they get
            // their aborted result here so every task reports exactly once.
            for item in queue.drain().await {
                queue.task_done();
                let result = TaskResult::aborted(item.task.id, item.attempts);
                stats.record(&result);
                if tx.send(result).await.is_err() {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Runs `tasks` to completion and collects every result.
    pub async fn run(&self, tasks: Vec<Task>) -> Result<Vec<TaskResult>, SchedulerError> {
        let total = tasks.len();
        let mut stream = self.submit(tasks)?;
        let mut results = Vec::with_capacity(total);
        while let Some(result) = stream.next().await {
            results.push(result);
        }
        Ok(results)
    }
}

/// One worker: pulls tasks, supervises attempts, settles results.
struct FleetWorker {
    id: String,
    queue: Arc<TaskQueue>,
    supervisor: Arc<AttemptSupervisor>,
    results: mpsc::Sender<TaskResult>,
    shutdown_rx: broadcast::Receiver<()>,
    retry: RetryPolicy,
    seal_key: Option<SealKey>,
    seal_output_dir: Option<PathBuf>,
    work_root: PathBuf,
    poll_interval: Duration,
    stats: Arc<SharedFleetStats>,
    shutting_down: bool,
}

impl FleetWorker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "fleet worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "fleet worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
            if self.shutting_down || self.queue.is_drained() {
                break;
            }

            match self.queue.dequeue(self.poll_interval).await {
                Some(item) => self.process(item).await,
                None => {
                    debug!(worker_id = %self.id, "no ready tasks");
                }
            }
        }

        info!(worker_id = %self.id, "fleet worker stopped");
    }

    async fn process(&mut self, mut item: QueuedTask) {
        let attempt_index = item.next_index;
        let task_id = item.task.id;
        info!(
            worker_id = %self.id,
            task_id = %task_id,
            attempt = attempt_index,
            "running task attempt"
        );

        self.stats.increment_active();
        let attempt = self
            .supervisor
            .run_attempt(&item.task, attempt_index, &mut self.shutdown_rx)
            .await;
        self.stats.decrement_active();

        let aborted = attempt.status == AttemptStatus::Aborted;
        let succeeded = attempt.status == AttemptStatus::Succeeded;
        let retryable = attempt.is_retryable();
        item.attempts.push(attempt);

        if !aborted && !succeeded && retryable && self.retry.allows_another(item.completed_attempts())
        {
            let delay = self.retry.delay_for(item.completed_attempts());
            warn!(
                worker_id = %self.id,
                task_id = %task_id,
                attempt = attempt_index,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, requeueing for retry"
            );
            self.stats.record_retry();
            item.next_index += 1;
            item.ready_at = Instant::now() + delay;
            self.queue.requeue(item).await;
            return;
        }

        let QueuedTask { task, attempts, .. } = item;
        let result = if aborted {
            self.shutting_down = true;
            TaskResult::aborted(task.id, attempts)
        } else if succeeded {
            TaskResult::success(task.id, attempts)
        } else {
            let failure = attempts
                .last()
                .and_then(|a| a.failure)
                .unwrap_or(FailureKind::TaskLogicFailure);
            let error = attempts
                .last()
                .and_then(|a| a.error.clone())
                .unwrap_or_else(|| "attempt failed".to_string());
            TaskResult::failure(task.id, attempts, failure, error)
        };

        let result = self.seal_outcome(&task, result);
        info!(
            worker_id = %self.id,
            task_id = %task_id,
            status = %result.status,
            attempts = result.attempt_count(),
            "task finished"
        );

        self.stats.record(&result);
        if self.results.send(result).await.is_err() {
            warn!(worker_id = %self.id, task_id = %task_id, "result receiver dropped");
        }
        self.queue.task_done();
    }

    /// Seals a terminal result when a key is configured.
    ///
    /// A sealing failure downgrades the whole result to a `Sealing` failure:
    /// a bundle that cannot be sealed must not pass as a clean outcome.
    fn seal_outcome(&self, task: &Task, result: TaskResult) -> TaskResult {
        let Some(key) = self.seal_key.as_ref() else {
            return result;
        };
        // Aborted runs skip sealing so shutdown stays prompt.
        if result.status == TaskStatus::Aborted {
            return result;
        }

        let task_dir = self.work_root.join(task.id.to_string());
        if !task_dir.is_dir() {
            debug!(task_id = %task.id, "no persisted artifacts, skipping seal");
            return result;
        }

        let sealed = ResultBundle::collect(task, &result, &task_dir)
            .and_then(|bundle| seal::seal(&bundle, key))
            .and_then(|envelope| {
                let path = match &self.seal_output_dir {
                    Some(dir) => {
                        std::fs::create_dir_all(dir)?;
                        dir.join(format!("{}.sealed.json", task.id))
                    }
                    None => task_dir.join("result.sealed"),
                };
                envelope.write_to(&path)?;
                Ok(path)
            });

        match sealed {
            Ok(path) => {
                info!(
                    task_id = %task.id,
                    path = %path.display(),
                    key_id = %key.key_id(),
                    "result bundle sealed"
                );
                result.with_sealed_path(path)
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "sealing failed");
                TaskResult::failure(
                    task.id,
                    result.attempts,
                    FailureKind::Sealing,
                    format!("sealing failed: {}", e),
                )
            }
        }
    }
}
