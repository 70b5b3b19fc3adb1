//! Container backend over the Docker daemon, using the bollard crate.
//!
//! Containers are created with resource limits from the task's
//! `ResourceRequest`, an idle entry command so the sandbox stays up until the
//! executor runs the agent, and a label marking them as harness-managed so
//! reconciliation can find leftovers.

use std::collections::{HashMap, HashSet};

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendKind, SandboxBackend, SandboxHandle, SandboxSpec, SandboxStatus};
use crate::error::BackendError;
use crate::executor::channel::{DockerChannel, ExecChannel};

/// Label marking containers created by this harness.
pub const MANAGED_LABEL: &str = "sandfleet.managed";

/// Label carrying the owning task id.
pub const TASK_LABEL: &str = "sandfleet.task";

/// CPU quota period in microseconds, the Docker default.
const CPU_PERIOD_USECS: i64 = 100_000;

/// Containers younger than this are exempt from the orphan sweep: they may
/// belong to a provisioning call that has not yet recorded its handle.
const SWEEP_GRACE_SECS: i64 = 60;

/// Configuration for the container backend.
#[derive(Debug, Clone)]
pub struct DockerBackendConfig {
    /// Network mode for sandbox containers. Defaults to "none": the agent
    /// only talks to the world through the exec channel.
    pub network_mode: String,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Command keeping the container alive until the executor takes over.
    pub idle_cmd: Vec<String>,
    /// Pull the image from its registry when missing locally.
    pub pull_if_missing: bool,
    /// User to run as, e.g. "1000:1000".
    pub user: Option<String>,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            network_mode: "none".to_string(),
            working_dir: "/workspace".to_string(),
            idle_cmd: vec!["sleep".to_string(), "infinity".to_string()],
            pull_if_missing: true,
            user: None,
        }
    }
}

impl DockerBackendConfig {
    /// Sets the network mode.
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = mode.into();
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Sets the user to run as.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Container backend talking to the local Docker daemon.
pub struct DockerBackend {
    docker: Docker,
    config: DockerBackendConfig,
}

impl DockerBackend {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::DaemonUnavailable` if the daemon is not
    /// reachable over its default socket.
    pub fn new(config: DockerBackendConfig) -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker, config })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker, config: DockerBackendConfig) -> Self {
        Self { docker, config }
    }

    /// Converts millicores into a Docker CPU quota against the default period.
    fn cpu_quota(cpu_millis: u64) -> i64 {
        (cpu_millis as i64) * (CPU_PERIOD_USECS / 1000)
    }

    /// Formats env pairs into Docker's KEY=VALUE form.
    fn format_env(env: &[(String, String)]) -> Vec<String> {
        env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Maps a bollard error to the backend taxonomy.
    fn classify(err: bollard::errors::Error, id: &str) -> BackendError {
        use bollard::errors::Error;

        match err {
            Error::DockerResponseServerError {
                status_code: 404, ..
            } => BackendError::NotFound { id: id.to_string() },
            Error::DockerResponseServerError {
                status_code,
                message,
            } => BackendError::Api {
                code: status_code,
                message,
            },
            other => BackendError::Transport(other.to_string()),
        }
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    async fn pull_image(&self, image: &str) -> Result<(), BackendError> {
        debug!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| {
                let msg = e.to_string();
                if msg.contains("not found") || msg.contains("manifest unknown") {
                    BackendError::InvalidSpec(format!("Image '{image}' does not exist: {msg}"))
                } else {
                    BackendError::Transport(format!("Failed to pull image '{image}': {msg}"))
                }
            })?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn provision(&self, spec: &SandboxSpec) -> Result<SandboxHandle, BackendError> {
        if self.config.pull_if_missing && !self.image_exists(&spec.image).await {
            self.pull_image(&spec.image).await?;
        }

        let host_config = HostConfig {
            memory: Some(spec.resources.memory_bytes as i64),
            cpu_period: Some(CPU_PERIOD_USECS),
            cpu_quota: Some(Self::cpu_quota(spec.resources.cpu_millis)),
            pids_limit: Some(spec.resources.pids_limit as i64),
            network_mode: Some(self.config.network_mode.clone()),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(TASK_LABEL.to_string(), spec.task_id.to_string());

        let env = Self::format_env(&spec.env);
        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(self.config.idle_cmd.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: Some(self.config.working_dir.clone()),
            user: self.config.user.clone(),
            labels: Some(labels),
            host_config: Some(host_config),
            tty: Some(true),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| match Self::classify(e, &spec.name) {
                BackendError::Transport(msg) if msg.contains("No such image") => {
                    BackendError::InvalidSpec(format!("Image '{}' missing: {msg}", spec.image))
                }
                other => other,
            })?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                BackendError::ProvisionFailed(format!("Failed to start container: {e}"))
            })?;

        info!(
            container = %spec.name,
            external_id = %response.id,
            task_id = %spec.task_id,
            "container sandbox provisioned"
        );

        Ok(SandboxHandle {
            id: Uuid::new_v4(),
            kind: BackendKind::Container,
            external_id: response.id,
            endpoint: None,
            auth_token: None,
            created_at: Utc::now(),
        })
    }

    async fn terminate(&self, external_id: &str) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(external_id, Some(options)).await {
            Ok(()) => {
                info!(external_id = %external_id, "container sandbox removed");
                Ok(())
            }
            Err(e) => match Self::classify(e, external_id) {
                // Already gone counts as success.
                BackendError::NotFound { .. } => {
                    debug!(external_id = %external_id, "container already gone");
                    Ok(())
                }
                other => {
                    warn!(external_id = %external_id, error = %other, "container removal failed");
                    Err(other)
                }
            },
        }
    }

    /// Removes labeled containers the registry no longer tracks.
    ///
    /// Lists containers carrying [`MANAGED_LABEL`], stopped ones included,
    /// and force-removes any whose id is absent from `known_ids`. Containers
    /// younger than the sweep grace period are left alone; a later pass
    /// reclaims them if they are still unclaimed.
    async fn sweep_orphans(&self, known_ids: &[String]) -> Result<usize, BackendError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![MANAGED_LABEL.to_string()]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| BackendError::Transport(format!("Failed to list containers: {e}")))?;

        let known: HashSet<&str> = known_ids.iter().map(String::as_str).collect();
        let cutoff = Utc::now().timestamp() - SWEEP_GRACE_SECS;
        let mut removed = 0;

        for container in containers {
            let id = match container.id {
                Some(id) => id,
                None => continue,
            };
            if known.contains(id.as_str()) {
                continue;
            }
            if container.created.unwrap_or(0) > cutoff {
                debug!(external_id = %id, "leaving recently created container to a later pass");
                continue;
            }

            warn!(external_id = %id, "removing labeled container with no registry row");
            match self.terminate(&id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(external_id = %id, error = %e, "leftover container removal failed");
                }
            }
        }

        Ok(removed)
    }

    async fn describe(&self, external_id: &str) -> Result<SandboxStatus, BackendError> {
        let info = match self
            .docker
            .inspect_container(external_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                return match Self::classify(e, external_id) {
                    BackendError::NotFound { .. } => Ok(SandboxStatus::NotFound),
                    other => Err(other),
                }
            }
        };

        let status = info
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default();

        Ok(match status.as_str() {
            "created" | "restarting" => SandboxStatus::Pending,
            "running" => SandboxStatus::Running,
            _ => SandboxStatus::Stopped,
        })
    }

    fn channel(&self, handle: &SandboxHandle) -> Result<Box<dyn ExecChannel>, BackendError> {
        Ok(Box::new(DockerChannel::new(
            self.docker.clone(),
            handle.external_id.clone(),
            self.config.working_dir.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DockerBackendConfig::default();

        assert_eq!(config.network_mode, "none");
        assert_eq!(config.working_dir, "/workspace");
        assert_eq!(config.idle_cmd, vec!["sleep", "infinity"]);
        assert!(config.pull_if_missing);
        assert!(config.user.is_none());
    }

    #[test]
    fn test_config_builders() {
        let config = DockerBackendConfig::default()
            .with_network_mode("bridge")
            .with_working_dir("/agent")
            .with_user("1000:1000");

        assert_eq!(config.network_mode, "bridge");
        assert_eq!(config.working_dir, "/agent");
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
    }

    #[test]
    fn test_cpu_quota_from_millicores() {
        // 1000 millicores is one full core of the 100ms period.
        assert_eq!(DockerBackend::cpu_quota(1000), 100_000);
        assert_eq!(DockerBackend::cpu_quota(2000), 200_000);
        assert_eq!(DockerBackend::cpu_quota(500), 50_000);
    }

    #[test]
    fn test_env_formatting() {
        let env = vec![
            ("BENCH_CASE".to_string(), "case-17".to_string()),
            ("MODE".to_string(), "eval".to_string()),
        ];

        let formatted = DockerBackend::format_env(&env);
        assert_eq!(formatted, vec!["BENCH_CASE=case-17", "MODE=eval"]);
    }

    #[test]
    fn test_classify_not_found() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".to_string(),
        };

        match DockerBackend::classify(err, "abc") {
            BackendError::NotFound { id } => assert_eq!(id, "abc"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_server_error_is_transient() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "driver failed".to_string(),
        };

        let classified = DockerBackend::classify(err, "abc");
        assert!(classified.is_transient());
    }

    #[test]
    fn test_classify_conflict_is_permanent() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name already in use".to_string(),
        };

        let classified = DockerBackend::classify(err, "abc");
        assert!(!classified.is_transient());
    }
}
