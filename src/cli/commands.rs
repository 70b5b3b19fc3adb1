//! CLI command definitions for sandfleet.
//!
//! This module provides the command-line surface for running benchmark
//! tasks across a fleet of isolated sandboxes, sweeping leftover sandboxes
//! after a crash, and opening sealed result envelopes.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{BackendKind, CloudVmBackend, DockerBackend, SandboxBackend};
use crate::config::HarnessConfig;
use crate::error::FailureKind;
use crate::executor::RemoteExecutor;
use crate::fleet::FleetScheduler;
use crate::lifecycle::{AttemptSupervisor, Reconciler};
use crate::seal::{self, EncryptedEnvelope, SealKey};
use crate::storage::SandboxRegistry;
use crate::task::{AgentConfig, ResourceRequest, Task, TaskResult, TaskStatus};

/// Default directory sealed result envelopes are written to.
const DEFAULT_SEALED_DIR: &str = "./sealed-results";

/// Default directory opened bundles are unpacked into.
const DEFAULT_UNPACK_DIR: &str = "./opened-results";

/// Sandbox fleet orchestrator for autonomous-agent benchmarks.
#[derive(Parser)]
#[command(name = "sandfleet")]
#[command(about = "Run benchmark agents across a fleet of isolated sandboxes")]
#[command(version)]
#[command(
    long_about = "sandfleet provisions ephemeral sandboxes (Docker containers or cloud VMs), runs one benchmark agent attempt per sandbox with retries and teardown, and seals result bundles with authenticated encryption.\n\nExample usage:\n  sandfleet run --manifest tasks.yaml --backend docker --max-concurrent 4 --out ./sealed-results"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run every task in a manifest across the sandbox fleet.
    ///
    /// Results stream to stdout as JSON lines, one per task, in completion
    /// order. When a seal key is configured, each terminal result bundle is
    /// sealed to `<out>/<task-id>.sealed.json`.
    Run(RunArgs),

    /// Sweep the registry for sandboxes a previous run left behind.
    #[command(alias = "gc")]
    Reconcile(ReconcileArgs),

    /// Decrypt a sealed result envelope and unpack its bundle.
    Open(OpenArgs),

    /// Show the sandboxes the registry knows about.
    Status(StatusArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the task manifest (YAML or JSON, one or many tasks).
    #[arg(short = 'm', long)]
    pub manifest: String,

    /// Sandbox backend to run on: docker or cloud.
    #[arg(short = 'b', long, env = "SANDFLEET_BACKEND")]
    pub backend: Option<String>,

    /// Maximum number of sandboxes alive at once.
    #[arg(short = 'c', long, env = "SANDFLEET_MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,

    /// Total attempt budget per task, first attempt included.
    #[arg(short = 'r', long, env = "SANDFLEET_MAX_ATTEMPTS")]
    pub max_retries: Option<u32>,

    /// Wall-clock deadline in seconds applied to every task, overriding
    /// per-task deadlines from the manifest.
    #[arg(short = 't', long, env = "SANDFLEET_TASK_TIMEOUT_SECS")]
    pub per_task_timeout: Option<u64>,

    /// Directory sealed result envelopes are written to.
    #[arg(short = 'o', long, default_value = DEFAULT_SEALED_DIR, env = "SANDFLEET_OUT_DIR")]
    pub out: String,

    /// File holding the hex-encoded 32-byte seal key. Sealing is disabled
    /// when neither this nor SANDFLEET_SEAL_KEY is set.
    #[arg(short = 'k', long, env = "SANDFLEET_KEY_FILE")]
    pub key_file: Option<String>,
}

/// Arguments for the reconcile command.
#[derive(Parser, Debug)]
pub struct ReconcileArgs {
    /// Sandbox backend to sweep: docker or cloud.
    #[arg(short = 'b', long, env = "SANDFLEET_BACKEND")]
    pub backend: Option<String>,

    /// Also delete terminated registry rows older than this many days.
    #[arg(short = 'p', long)]
    pub prune_days: Option<u32>,

    /// Output JSON to stdout instead of a summary line.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for the open command.
#[derive(Parser, Debug)]
pub struct OpenArgs {
    /// Path to the sealed envelope file.
    #[arg(short = 'e', long)]
    pub envelope: String,

    /// Directory the bundle is unpacked into, under its task id.
    #[arg(short = 'o', long, default_value = DEFAULT_UNPACK_DIR)]
    pub out: String,

    /// File holding the hex-encoded 32-byte seal key.
    #[arg(short = 'k', long, env = "SANDFLEET_KEY_FILE")]
    pub key_file: String,

    /// Output JSON to stdout instead of a summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for the status command.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Registry sqlite file (defaults to the configured work root).
    #[arg(short = 'r', long)]
    pub registry: Option<String>,

    /// Only show sandboxes that are not terminated.
    #[arg(long)]
    pub live: bool,

    /// Output JSON to stdout instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the sandfleet CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => {
            run_fleet_command(args).await?;
        }
        Commands::Reconcile(args) => {
            run_reconcile_command(args).await?;
        }
        Commands::Open(args) => {
            run_open_command(args).await?;
        }
        Commands::Status(args) => {
            run_status_command(args).await?;
        }
    }
    Ok(())
}

// ============================================================================
// Run Command Implementation
// ============================================================================

/// One JSON line emitted to stdout per finished task.
#[derive(Debug, Clone, Serialize)]
struct ResultLine {
    task_id: Uuid,
    benchmark: String,
    status: TaskStatus,
    attempts: u32,
    exit_code: Option<i64>,
    failure: Option<FailureKind>,
    error: Option<String>,
    duration_ms: u64,
    sealed_path: Option<PathBuf>,
}

impl ResultLine {
    fn from_result(result: &TaskResult, benchmark: &str) -> Self {
        let final_attempt = result.final_attempt();
        let duration_ms = result
            .attempts
            .first()
            .map(|first| {
                (result.completed_at - first.started_at)
                    .num_milliseconds()
                    .max(0) as u64
            })
            .unwrap_or(0);

        Self {
            task_id: result.task_id,
            benchmark: benchmark.to_string(),
            status: result.status,
            attempts: result.attempt_count(),
            exit_code: final_attempt.and_then(|a| a.exit_code),
            failure: result.failure,
            error: result.error.clone(),
            duration_ms,
            sealed_path: result.sealed_path.clone(),
        }
    }
}

async fn run_fleet_command(args: RunArgs) -> anyhow::Result<()> {
    let manifest_path = Path::new(&args.manifest);
    if !manifest_path.exists() {
        return Err(anyhow::anyhow!(
            "Manifest does not exist: {}",
            args.manifest
        ));
    }
    let tasks = load_manifest(manifest_path, args.per_task_timeout)?;
    if tasks.is_empty() {
        return Err(anyhow::anyhow!(
            "Manifest contains no tasks: {}",
            args.manifest
        ));
    }

    let mut config = HarnessConfig::from_env()?;
    if let Some(backend) = args.backend.as_deref() {
        config.backend = backend.parse::<BackendKind>().map_err(|e| anyhow::anyhow!(e))?;
    }
    if let Some(max) = args.max_concurrent {
        config.max_concurrent_sandboxes = max;
    }
    if let Some(attempts) = args.max_retries {
        config.retry.max_attempts = attempts;
    }
    if let Some(key_file) = args.key_file.as_deref() {
        config.seal_key_hex = Some(read_key_hex(Path::new(key_file))?);
    }
    config.validate()?;

    fs::create_dir_all(&config.work_root)?;
    if let Some(dir) = config.registry_path().parent() {
        fs::create_dir_all(dir)?;
    }

    let backend = build_backend(&config)?;
    let registry = Arc::new(SandboxRegistry::connect(&config.registry_url()).await?);

    // Crash recovery: retire whatever a previous run left behind before
    // provisioning anything new.
    let report = Reconciler::new(Arc::clone(&backend), Arc::clone(&registry))
        .run()
        .await?;
    if report.examined > 0 || report.swept > 0 {
        info!(%report, "startup reconciliation finished");
    }

    let executor = RemoteExecutor::new(config.executor_config());
    let supervisor = AttemptSupervisor::new(
        Arc::clone(&backend),
        executor,
        Arc::clone(&registry),
        config.supervisor_config(),
    );
    let fleet_config = config.fleet_config()?.with_seal_output_dir(&args.out);
    let scheduler = FleetScheduler::new(supervisor, fleet_config);

    // First Ctrl-C broadcasts shutdown; in-flight attempts abort and tear
    // down, queued tasks report as aborted.
    let shutdown = scheduler.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining fleet");
            let _ = shutdown.send(());
        }
    });

    let benchmarks: HashMap<Uuid, String> = tasks
        .iter()
        .map(|task| (task.id, task.benchmark.clone()))
        .collect();
    info!(
        tasks = tasks.len(),
        backend = %config.backend,
        manifest = %args.manifest,
        "starting fleet run"
    );

    let mut results = scheduler.submit(tasks)?;
    while let Some(result) = results.next().await {
        let benchmark = benchmarks
            .get(&result.task_id)
            .map(String::as_str)
            .unwrap_or("");
        let line = ResultLine::from_result(&result, benchmark);
        println!("{}", serde_json::to_string(&line)?);
    }

    let stats = scheduler.stats();
    info!(
        succeeded = stats.tasks_succeeded,
        failed = stats.tasks_failed,
        aborted = stats.tasks_aborted,
        retries = stats.retries,
        "fleet run complete"
    );

    Ok(())
}

// ============================================================================
// Reconcile Command Implementation
// ============================================================================

async fn run_reconcile_command(args: ReconcileArgs) -> anyhow::Result<()> {
    let mut config = HarnessConfig::from_env()?;
    if let Some(backend) = args.backend.as_deref() {
        config.backend = backend.parse::<BackendKind>().map_err(|e| anyhow::anyhow!(e))?;
    }
    config.validate()?;

    let registry_path = config.registry_path();
    if !registry_path.exists() {
        println!("No registry at {}, nothing to reconcile", registry_path.display());
        return Ok(());
    }

    let backend = build_backend(&config)?;
    let registry = Arc::new(SandboxRegistry::connect(&config.registry_url()).await?);
    let report = Reconciler::new(backend, Arc::clone(&registry)).run().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    if let Some(days) = args.prune_days {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
        let pruned = registry.prune_terminated(cutoff).await?;
        info!(pruned, days, "pruned terminated registry rows");
        if !args.json {
            println!("pruned {} terminated rows older than {} days", pruned, days);
        }
    }

    Ok(())
}

// ============================================================================
// Open Command Implementation
// ============================================================================

/// Summary of one opened envelope.
#[derive(Debug, Clone, Serialize)]
struct OpenOutput {
    task_id: Uuid,
    benchmark: String,
    success: bool,
    attempt_count: u32,
    completed_at: chrono::DateTime<chrono::Utc>,
    unpacked_to: PathBuf,
}

async fn run_open_command(args: OpenArgs) -> anyhow::Result<()> {
    let envelope_path = Path::new(&args.envelope);
    if !envelope_path.exists() {
        return Err(anyhow::anyhow!(
            "Envelope does not exist: {}",
            args.envelope
        ));
    }

    let hex = read_key_hex(Path::new(&args.key_file))?;
    let key = SealKey::from_hex(&hex)
        .map_err(|e| anyhow::anyhow!("Invalid seal key in {}: {}", args.key_file, e))?;

    let envelope = EncryptedEnvelope::read_from(envelope_path)?;
    let bundle = seal::open(&envelope, &key)?;

    let dest = Path::new(&args.out).join(bundle.task_id.to_string());
    bundle.unpack(&dest)?;

    let output = OpenOutput {
        task_id: bundle.task_id,
        benchmark: bundle.benchmark.clone(),
        success: bundle.success,
        attempt_count: bundle.attempt_count,
        completed_at: bundle.completed_at,
        unpacked_to: dest.clone(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Opened bundle for task {}", output.task_id);
        println!("  benchmark: {}", output.benchmark);
        println!("  success: {}", output.success);
        println!("  attempts: {}", output.attempt_count);
        println!("  completed: {}", output.completed_at);
        println!("  unpacked to: {}", dest.display());
    }

    Ok(())
}

// ============================================================================
// Status Command Implementation
// ============================================================================

/// One registry row as shown by the status command.
#[derive(Debug, Clone, Serialize)]
struct StatusEntry {
    id: Uuid,
    task_id: Uuid,
    backend: String,
    state: String,
    external_id: String,
    attempt: u32,
    age_secs: i64,
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let mut config = HarnessConfig::from_env()?;
    if let Some(path) = args.registry.as_deref() {
        config.registry_path = Some(PathBuf::from(path));
    }

    let registry_path = config.registry_path();
    if !registry_path.exists() {
        println!("No registry at {}", registry_path.display());
        return Ok(());
    }

    let registry = SandboxRegistry::connect(&config.registry_url()).await?;
    let rows = if args.live {
        registry.live().await?
    } else {
        registry.all().await?
    };

    let now = chrono::Utc::now();
    let entries: Vec<StatusEntry> = rows
        .iter()
        .map(|row| StatusEntry {
            id: row.id,
            task_id: row.task_id,
            backend: row.backend.to_string(),
            state: row.state.to_string(),
            external_id: row.external_id.clone(),
            attempt: row.attempt,
            age_secs: (now - row.updated_at).num_seconds().max(0),
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No sandboxes in {}", registry_path.display());
    } else {
        println!("{} sandboxes in {}", entries.len(), registry_path.display());
        for entry in &entries {
            println!(
                "  {}  {:<13} {:<9} task {}  attempt {}  age {}",
                entry.id,
                entry.state,
                entry.backend,
                entry.task_id,
                entry.attempt,
                format_age(entry.age_secs)
            );
        }
    }

    Ok(())
}

// ============================================================================
// Shared Helpers
// ============================================================================

/// One task as written in a manifest file.
///
/// Deadlines and resources are optional; harness defaults apply when a field
/// is absent.
#[derive(Debug, Clone, Deserialize)]
struct ManifestTask {
    /// Benchmark reference, e.g. "swe-suite/case-17".
    benchmark: String,
    /// Image the sandbox boots from.
    image: String,
    /// Command line starting the agent inside the sandbox.
    entry_point: Vec<String>,
    /// Environment variables handed to the entry point.
    #[serde(default)]
    env: BTreeMap<String, String>,
    /// Per-attempt wall-clock deadline in seconds.
    #[serde(default)]
    deadline_seconds: Option<u64>,
    /// Resource requirements for the sandbox.
    #[serde(default)]
    resources: ManifestResources,
}

/// Optional resource fields of a manifest task.
#[derive(Debug, Clone, Default, Deserialize)]
struct ManifestResources {
    memory_bytes: Option<u64>,
    cpu_millis: Option<u64>,
    pids_limit: Option<u32>,
    disk_bytes: Option<u64>,
}

/// The accepted manifest shapes: a `tasks:` list, a bare list, or one task.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Wrapped { tasks: Vec<ManifestTask> },
    List(Vec<ManifestTask>),
    Single(ManifestTask),
}

impl ManifestTask {
    fn into_task(self, deadline_override: Option<u64>) -> Task {
        let mut agent = AgentConfig::new(self.image, self.entry_point);
        for (key, value) in self.env {
            agent = agent.with_env(key, value);
        }

        let mut resources = ResourceRequest::default();
        if let Some(bytes) = self.resources.memory_bytes {
            resources = resources.with_memory_bytes(bytes);
        }
        if let Some(millis) = self.resources.cpu_millis {
            resources = resources.with_cpu_millis(millis);
        }
        if let Some(limit) = self.resources.pids_limit {
            resources = resources.with_pids_limit(limit);
        }
        if let Some(bytes) = self.resources.disk_bytes {
            resources = resources.with_disk_bytes(bytes);
        }

        let mut task = Task::new(self.benchmark, agent).with_resources(resources);
        if let Some(seconds) = deadline_override.or(self.deadline_seconds) {
            task = task.with_deadline_seconds(seconds);
        }
        task
    }
}

/// Loads tasks from a YAML or JSON manifest file.
fn load_manifest(path: &Path, deadline_override: Option<u64>) -> anyhow::Result<Vec<Task>> {
    let content = fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let manifest: ManifestFile = if is_json {
        serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse manifest {}: {}", path.display(), e))?
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse manifest {}: {}", path.display(), e))?
    };

    let entries = match manifest {
        ManifestFile::Wrapped { tasks } => tasks,
        ManifestFile::List(tasks) => tasks,
        ManifestFile::Single(task) => vec![task],
    };

    Ok(entries
        .into_iter()
        .map(|entry| entry.into_task(deadline_override))
        .collect())
}

/// Constructs the backend the configuration selects.
fn build_backend(config: &HarnessConfig) -> anyhow::Result<Arc<dyn SandboxBackend>> {
    match config.backend {
        BackendKind::Container => {
            let backend = DockerBackend::new(config.docker.clone()).map_err(|e| {
                anyhow::anyhow!(
                    "Docker backend is unavailable; is the daemon running? {}",
                    e
                )
            })?;
            Ok(Arc::new(backend))
        }
        BackendKind::CloudVm => Ok(Arc::new(CloudVmBackend::new(config.cloud_api_config()?))),
    }
}

/// Reads a hex seal key from a file, trimming surrounding whitespace.
fn read_key_hex(path: &Path) -> anyhow::Result<String> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read key file {}: {}", path.display(), e))?;
    let hex = content.trim().to_string();
    if hex.is_empty() {
        return Err(anyhow::anyhow!("Key file is empty: {}", path.display()));
    }
    Ok(hex)
}

/// Formats an age in seconds as a compact human-readable string.
fn format_age(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}
