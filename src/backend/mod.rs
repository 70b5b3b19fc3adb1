//! Sandbox backend abstraction.
//!
//! A backend turns sandbox specifications into running execution environments
//! and retires them again. Two implementations exist:
//!
//! - `DockerBackend`: local containers via the Docker daemon
//! - `CloudVmBackend`: short-lived virtual machines via a provisioner REST API
//!
//! The lifecycle state machine is backend-agnostic: it only sees this trait,
//! the opaque handles it returns, and the execution channel each backend
//! hands out for a booted sandbox.

pub mod cloud;
pub mod docker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BackendError;
use crate::executor::channel::ExecChannel;
use crate::task::ResourceRequest;

pub use cloud::{CloudApiConfig, CloudVmBackend};
pub use docker::{DockerBackend, DockerBackendConfig};

/// Which kind of execution environment a backend manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local container managed through the Docker daemon.
    Container,
    /// Short-lived cloud virtual machine.
    CloudVm,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Container => write!(f, "container"),
            BackendKind::CloudVm => write!(f, "cloud_vm"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(BackendKind::Container),
            "cloud_vm" | "cloud" | "vm" => Ok(BackendKind::CloudVm),
            other => Err(format!(
                "unknown backend kind '{}': expected 'docker' or 'cloud'",
                other
            )),
        }
    }
}

/// Specification handed to a backend to provision one sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Task the sandbox is provisioned for.
    pub task_id: Uuid,
    /// Backend-visible name, unique per provisioning call.
    pub name: String,
    /// Image the sandbox boots from.
    pub image: String,
    /// Resource limits to apply.
    pub resources: ResourceRequest,
    /// Environment variables baked into the sandbox.
    pub env: Vec<(String, String)>,
}

impl SandboxSpec {
    /// Builds a spec for a task, deriving a unique sandbox name.
    pub fn for_task(task: &crate::task::Task) -> Self {
        let short_id = task.id.simple().to_string();
        Self {
            task_id: task.id,
            name: format!("sandfleet-{}-{}", &short_id[..12], Utc::now().timestamp()),
            image: task.agent.image.clone(),
            resources: task.resources,
            env: task.agent.env.clone(),
        }
    }
}

/// Opaque reference to a provisioned sandbox.
///
/// `external_id` is the backend's own identifier (container id, instance id)
/// and is the key for idempotent teardown. The endpoint and token, when
/// present, authenticate the execution channel for VM backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Harness-side identifier for the sandbox.
    pub id: Uuid,
    /// Backend kind that owns the resource.
    pub kind: BackendKind,
    /// Backend-native resource identifier.
    pub external_id: String,
    /// Network endpoint of the in-sandbox execution service, for VM backends.
    pub endpoint: Option<String>,
    /// Bearer token for the execution channel, for VM backends.
    pub auth_token: Option<String>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
}

/// Coarse status reported by `describe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// Resource accepted but not yet running.
    Pending,
    /// Resource is up.
    Running,
    /// Resource exists but has stopped.
    Stopped,
    /// Backend has no record of the resource.
    NotFound,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxStatus::Pending => write!(f, "pending"),
            SandboxStatus::Running => write!(f, "running"),
            SandboxStatus::Stopped => write!(f, "stopped"),
            SandboxStatus::NotFound => write!(f, "not_found"),
        }
    }
}

/// Capability interface over sandbox execution environments.
///
/// All operations are safe to retry. `terminate` on a resource that no longer
/// exists reports success, so crash recovery can blindly re-issue teardowns.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// The backend kind this implementation manages.
    fn kind(&self) -> BackendKind;

    /// Creates and starts a sandbox for the given spec.
    async fn provision(&self, spec: &SandboxSpec) -> Result<SandboxHandle, BackendError>;

    /// Destroys the resource behind `external_id`. Missing resources are Ok.
    async fn terminate(&self, external_id: &str) -> Result<(), BackendError>;

    /// Finds leftover resources this harness created that no registry row
    /// tracks, and removes them. `known_ids` are the external ids of every
    /// row the caller still holds; resources outside that set are reclaimed.
    /// Returns how many were removed.
    ///
    /// Catches resources created in the window between provisioning and the
    /// registry learning their id. Backends that cannot enumerate their
    /// resources reclaim nothing.
    async fn sweep_orphans(&self, _known_ids: &[String]) -> Result<usize, BackendError> {
        Ok(0)
    }

    /// Reports the current status of the resource behind `external_id`.
    async fn describe(&self, external_id: &str) -> Result<SandboxStatus, BackendError>;

    /// Opens the execution channel for a provisioned sandbox.
    fn channel(&self, handle: &SandboxHandle) -> Result<Box<dyn ExecChannel>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{AgentConfig, Task};

    #[test]
    fn test_backend_kind_display_and_parse() {
        assert_eq!(BackendKind::Container.to_string(), "container");
        assert_eq!(BackendKind::CloudVm.to_string(), "cloud_vm");

        assert_eq!("docker".parse::<BackendKind>(), Ok(BackendKind::Container));
        assert_eq!("cloud".parse::<BackendKind>(), Ok(BackendKind::CloudVm));
        assert_eq!("vm".parse::<BackendKind>(), Ok(BackendKind::CloudVm));
        assert!("firecracker".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_spec_for_task_derives_unique_name() {
        let task = Task::new(
            "suite/case",
            AgentConfig::new("bench/agent:1", vec!["/run".into()]),
        );
        let spec = SandboxSpec::for_task(&task);

        assert_eq!(spec.task_id, task.id);
        assert_eq!(spec.image, "bench/agent:1");
        assert!(spec.name.starts_with("sandfleet-"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SandboxStatus::Running.to_string(), "running");
        assert_eq!(SandboxStatus::NotFound.to_string(), "not_found");
    }

    #[test]
    fn test_handle_serialization() {
        let handle = SandboxHandle {
            id: Uuid::new_v4(),
            kind: BackendKind::Container,
            external_id: "abc123".to_string(),
            endpoint: None,
            auth_token: None,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&handle).expect("serialization should work");
        let parsed: SandboxHandle =
            serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed.external_id, "abc123");
        assert_eq!(parsed.kind, BackendKind::Container);
    }
}
