//! Remote executor - runs one task attempt inside a booted sandbox.
//!
//! The executor owns the middle of an attempt: it waits for the sandbox to
//! become reachable (boot takes time), assembles and uploads the task
//! payload, invokes the agent entry point under the task's wall-clock
//! deadline, streams output into the attempt log, and downloads whatever the
//! agent left in the output directory. A deadline expiry triggers a forced
//! remote kill before the timeout is reported.

pub mod channel;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::ExecutorError;
use crate::executor::channel::ExecChannel;
use crate::storage::AttemptScope;
use crate::task::Task;

/// Bytes of combined output kept in memory for quick inspection.
const LOG_TAIL_LIMIT: usize = 16 * 1024;

/// Default readiness budget in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 120;

/// Initial readiness poll delay in milliseconds.
const DEFAULT_POLL_INITIAL_MS: u64 = 500;

/// Cap on the readiness poll delay in milliseconds.
const DEFAULT_POLL_MAX_MS: u64 = 5_000;

/// Remote path the payload is uploaded to.
const DEFAULT_PAYLOAD_DEST: &str = "/workspace/payload";

/// Remote path the agent writes results into.
const DEFAULT_OUTPUT_SRC: &str = "/workspace/output";

/// Sink for an attempt's combined stdout/stderr stream.
///
/// Appends to the attempt log file and keeps a bounded in-memory tail so the
/// attempt record can carry recent output without re-reading the file.
pub struct LogSink {
    writer: Option<std::io::BufWriter<std::fs::File>>,
    path: Option<PathBuf>,
    tail: Vec<u8>,
}

impl LogSink {
    /// Creates a sink backed by a log file.
    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            writer: Some(std::io::BufWriter::new(file)),
            path: Some(path.to_path_buf()),
            tail: Vec::new(),
        })
    }

    /// Creates a sink that only keeps the in-memory tail.
    pub fn in_memory() -> Self {
        Self {
            writer: None,
            path: None,
            tail: Vec::new(),
        }
    }

    /// Appends a chunk of output.
    pub fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(chunk)?;
        }
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > LOG_TAIL_LIMIT {
            let overflow = self.tail.len() - LOG_TAIL_LIMIT;
            self.tail.drain(..overflow);
        }
        Ok(())
    }

    /// Flushes buffered file output.
    pub fn flush(&mut self) -> std::io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// The bounded tail of everything written so far.
    pub fn tail(&self) -> String {
        String::from_utf8_lossy(&self.tail).into_owned()
    }

    /// Path of the backing log file, when there is one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Configuration for the remote executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Budget for the sandbox to become reachable, in seconds.
    pub connect_timeout_secs: u64,
    /// Initial delay between readiness probes, in milliseconds.
    pub poll_initial_ms: u64,
    /// Maximum delay between readiness probes, in milliseconds.
    pub poll_max_ms: u64,
    /// Remote directory the payload is uploaded to.
    pub payload_dest: String,
    /// Remote directory the agent writes results into.
    pub output_src: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            poll_initial_ms: DEFAULT_POLL_INITIAL_MS,
            poll_max_ms: DEFAULT_POLL_MAX_MS,
            payload_dest: DEFAULT_PAYLOAD_DEST.to_string(),
            output_src: DEFAULT_OUTPUT_SRC.to_string(),
        }
    }
}

impl ExecutorConfig {
    /// Sets the readiness budget in seconds.
    pub fn with_connect_timeout_secs(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    /// Sets the readiness poll bounds in milliseconds.
    pub fn with_poll_bounds_ms(mut self, initial: u64, max: u64) -> Self {
        self.poll_initial_ms = initial;
        self.poll_max_ms = max;
        self
    }

    /// Sets the remote payload directory.
    pub fn with_payload_dest(mut self, dest: impl Into<String>) -> Self {
        self.payload_dest = dest.into();
        self
    }

    /// Sets the remote output directory.
    pub fn with_output_src(mut self, src: impl Into<String>) -> Self {
        self.output_src = src.into();
        self
    }
}

/// What a completed (non-errored) execution produced.
#[derive(Debug)]
pub struct RunOutput {
    /// Exit code of the agent entry point.
    pub exit_code: i64,
    /// Bounded tail of the combined output stream.
    pub log_tail: String,
    /// Path of the attempt log file.
    pub log_path: PathBuf,
    /// Local directory the remote output was downloaded into.
    pub output_path: PathBuf,
}

/// Runs task attempts against execution channels.
pub struct RemoteExecutor {
    config: ExecutorConfig,
}

impl RemoteExecutor {
    /// Creates an executor with the given configuration.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Runs one attempt of `task` through `channel`, staging files in `scope`.
    ///
    /// The returned `RunOutput` carries the agent's exit code; interpreting a
    /// non-zero code as a task logic failure is the caller's decision, not an
    /// executor error.
    pub async fn run_task(
        &self,
        channel: &dyn ExecChannel,
        task: &Task,
        scope: &AttemptScope,
    ) -> Result<RunOutput, ExecutorError> {
        self.wait_until_ready(channel).await?;

        // Payload: the task manifest plus anything pre-staged in the scope.
        let manifest = serde_json::to_vec_pretty(task)?;
        std::fs::write(scope.payload_dir().join("task.json"), manifest)?;
        channel
            .upload(&scope.payload_dir(), &self.config.payload_dest)
            .await?;

        // Seed the remote output directory so download always has a target.
        channel
            .upload(&scope.output_dir(), &self.config.output_src)
            .await?;

        let mut env = task.agent.env.clone();
        env.push((
            "SANDBOX_PAYLOAD_DIR".to_string(),
            self.config.payload_dest.clone(),
        ));
        env.push((
            "SANDBOX_OUTPUT_DIR".to_string(),
            self.config.output_src.clone(),
        ));

        let log_path = scope.log_path();
        let mut sink = LogSink::to_file(&log_path)?;

        info!(
            task_id = %task.id,
            deadline_secs = task.deadline_seconds,
            "invoking agent entry point"
        );

        let deadline = Duration::from_secs(task.deadline_seconds);
        let exec_result = tokio::time::timeout(
            deadline,
            channel.exec(&task.agent.entry_point, &env, &mut sink),
        )
        .await;

        let exit_code = match exec_result {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                sink.flush().ok();
                return Err(e);
            }
            Err(_) => {
                sink.flush().ok();
                warn!(task_id = %task.id, "deadline expired, killing remote process");
                if let Err(e) = channel.kill().await {
                    warn!(task_id = %task.id, error = %e, "remote kill failed");
                }
                return Err(ExecutorError::Timeout {
                    seconds: task.deadline_seconds,
                });
            }
        };

        sink.flush()?;
        let log_tail = sink.tail();

        // Artifacts land next to the scope root, under the remote dir's name.
        match channel.download(&self.config.output_src, scope.root()).await {
            Ok(()) => {}
            Err(e) if exit_code != 0 => {
                // A failed agent may have produced nothing worth keeping.
                debug!(task_id = %task.id, error = %e, "artifact download skipped");
            }
            Err(e) => return Err(e),
        }

        Ok(RunOutput {
            exit_code,
            log_tail,
            log_path,
            output_path: scope.output_dir(),
        })
    }

    /// Blocks until the sandbox answers probes, within the connect budget.
    ///
    /// Callers that track sandbox state call this before [`run_task`]
    /// (which probes again, cheaply, since the sandbox is already up) so
    /// that readiness is observed where the state transition happens.
    ///
    /// [`run_task`]: Self::run_task
    pub async fn ensure_ready(&self, channel: &dyn ExecChannel) -> Result<(), ExecutorError> {
        self.wait_until_ready(channel).await
    }

    /// Polls the channel with growing delays until ready or out of budget.
    async fn wait_until_ready(&self, channel: &dyn ExecChannel) -> Result<(), ExecutorError> {
        let budget = Duration::from_secs(self.config.connect_timeout_secs);
        let started = Instant::now();
        let mut delay = Duration::from_millis(self.config.poll_initial_ms);

        loop {
            if channel.probe().await? {
                debug!(waited_ms = started.elapsed().as_millis() as u64, "sandbox ready");
                return Ok(());
            }
            if started.elapsed() + delay >= budget {
                return Err(ExecutorError::NotReachable {
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(self.config.poll_max_ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AgentConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct ScriptedChannel {
        ready_after_probes: u32,
        probes: AtomicU32,
        exec_exit_code: i64,
        exec_output: &'static str,
        exec_hang: bool,
        kill_called: AtomicBool,
    }

    impl ScriptedChannel {
        fn ready(exit_code: i64) -> Self {
            Self {
                ready_after_probes: 0,
                probes: AtomicU32::new(0),
                exec_exit_code: exit_code,
                exec_output: "agent output\n",
                exec_hang: false,
                kill_called: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ExecChannel for ScriptedChannel {
        async fn probe(&self) -> Result<bool, ExecutorError> {
            let seen = self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(seen >= self.ready_after_probes)
        }

        async fn upload(&self, _local_dir: &Path, _dest: &str) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn exec(
            &self,
            _cmd: &[String],
            _env: &[(String, String)],
            sink: &mut LogSink,
        ) -> Result<i64, ExecutorError> {
            if self.exec_hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            sink.write(self.exec_output.as_bytes())?;
            Ok(self.exec_exit_code)
        }

        async fn download(&self, src: &str, local_dir: &Path) -> Result<(), ExecutorError> {
            let name = src.rsplit('/').next().unwrap_or("output");
            std::fs::create_dir_all(local_dir.join(name))?;
            Ok(())
        }

        async fn kill(&self) -> Result<(), ExecutorError> {
            self.kill_called.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn quick_config() -> ExecutorConfig {
        ExecutorConfig::default()
            .with_connect_timeout_secs(2)
            .with_poll_bounds_ms(10, 50)
    }

    fn sample_task() -> Task {
        Task::new(
            "suite/case",
            AgentConfig::new("bench/agent:1", vec!["/opt/agent/run".to_string()]),
        )
        .with_deadline_seconds(30)
    }

    #[test]
    fn test_log_sink_tail_is_bounded() {
        let mut sink = LogSink::in_memory();
        let chunk = vec![b'x'; 10 * 1024];
        sink.write(&chunk).expect("write");
        sink.write(&chunk).expect("write");
        sink.write(b"end-marker").expect("write");

        let tail = sink.tail();
        assert!(tail.len() <= LOG_TAIL_LIMIT);
        assert!(tail.ends_with("end-marker"));
    }

    #[test]
    fn test_log_sink_writes_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("agent.log");

        let mut sink = LogSink::to_file(&path).expect("create sink");
        sink.write(b"line one\n").expect("write");
        sink.write(b"line two\n").expect("write");
        sink.flush().expect("flush");

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(contents, "line one\nline two\n");
        assert_eq!(sink.path(), Some(path.as_path()));
    }

    #[test]
    fn test_executor_config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.connect_timeout_secs, 120);
        assert_eq!(config.poll_initial_ms, 500);
        assert_eq!(config.poll_max_ms, 5_000);
        assert_eq!(config.payload_dest, "/workspace/payload");
        assert_eq!(config.output_src, "/workspace/output");
    }

    #[tokio::test]
    async fn test_run_task_success_streams_and_downloads() {
        let work = tempfile::tempdir().expect("temp dir");
        let task = sample_task();
        let scope = AttemptScope::create(work.path(), task.id, 1).expect("scope");

        let channel = ScriptedChannel::ready(0);
        let executor = RemoteExecutor::new(quick_config());

        let output = executor
            .run_task(&channel, &task, &scope)
            .await
            .expect("run should succeed");

        assert_eq!(output.exit_code, 0);
        assert!(output.log_tail.contains("agent output"));
        assert!(output.log_path.exists());
        assert!(output.output_path.exists());
        // The payload manifest was staged before upload.
        assert!(scope.payload_dir().join("task.json").exists());
    }

    #[tokio::test]
    async fn test_run_task_nonzero_exit_is_not_an_error() {
        let work = tempfile::tempdir().expect("temp dir");
        let task = sample_task();
        let scope = AttemptScope::create(work.path(), task.id, 1).expect("scope");

        let channel = ScriptedChannel::ready(3);
        let executor = RemoteExecutor::new(quick_config());

        let output = executor
            .run_task(&channel, &task, &scope)
            .await
            .expect("run should complete");
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_run_task_waits_for_readiness() {
        let work = tempfile::tempdir().expect("temp dir");
        let task = sample_task();
        let scope = AttemptScope::create(work.path(), task.id, 1).expect("scope");

        let channel = ScriptedChannel {
            ready_after_probes: 3,
            ..ScriptedChannel::ready(0)
        };
        let executor = RemoteExecutor::new(quick_config());

        executor
            .run_task(&channel, &task, &scope)
            .await
            .expect("run should succeed after boot polls");
        assert!(channel.probes.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_run_task_reports_unreachable_sandbox() {
        let work = tempfile::tempdir().expect("temp dir");
        let task = sample_task();
        let scope = AttemptScope::create(work.path(), task.id, 1).expect("scope");

        let channel = ScriptedChannel {
            ready_after_probes: u32::MAX,
            ..ScriptedChannel::ready(0)
        };
        let executor = RemoteExecutor::new(
            ExecutorConfig::default()
                .with_connect_timeout_secs(1)
                .with_poll_bounds_ms(10, 20),
        );

        let err = executor
            .run_task(&channel, &task, &scope)
            .await
            .expect_err("should give up");
        assert!(matches!(err, ExecutorError::NotReachable { .. }));
    }

    #[tokio::test]
    async fn test_run_task_deadline_kills_remote() {
        let work = tempfile::tempdir().expect("temp dir");
        let task = sample_task().with_deadline_seconds(1);
        let scope = AttemptScope::create(work.path(), task.id, 1).expect("scope");

        let channel = ScriptedChannel {
            exec_hang: true,
            ..ScriptedChannel::ready(0)
        };
        let executor = RemoteExecutor::new(quick_config());

        let err = executor
            .run_task(&channel, &task, &scope)
            .await
            .expect_err("should time out");
        assert!(matches!(err, ExecutorError::Timeout { seconds: 1 }));
        assert!(channel.kill_called.load(Ordering::SeqCst));
    }
}
