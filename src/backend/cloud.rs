//! Cloud VM backend over a provisioner REST API.
//!
//! Instances are created with POST /v1/instances, destroyed with
//! DELETE /v1/instances/{id} and inspected with GET /v1/instances/{id}.
//! The provisioner hands back the endpoint and bearer token of the agent
//! service running inside the booted VM; the executor talks to that service
//! through an [`HttpChannel`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendKind, SandboxBackend, SandboxHandle, SandboxSpec, SandboxStatus};
use crate::error::BackendError;
use crate::executor::channel::{ExecChannel, HttpChannel};

/// Request timeout for provisioner API calls in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Configuration for the cloud provisioner client.
#[derive(Clone)]
pub struct CloudApiConfig {
    /// Base URL of the provisioner API, e.g. "https://vm.example.net".
    pub api_base: String,
    /// Bearer token authenticating against the provisioner.
    pub api_token: String,
    /// Region hint passed through to instance creation.
    pub region: Option<String>,
}

impl CloudApiConfig {
    /// Creates a config from a base URL and token.
    pub fn new(api_base: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_token: api_token.into(),
            region: None,
        }
    }

    /// Sets the region hint.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Returns the token in masked form for diagnostics.
    pub fn token_masked(&self) -> String {
        if self.api_token.len() <= 8 {
            "*".repeat(self.api_token.len())
        } else {
            format!(
                "{}...{}",
                &self.api_token[..4],
                &self.api_token[self.api_token.len() - 4..]
            )
        }
    }
}

impl std::fmt::Debug for CloudApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudApiConfig")
            .field("api_base", &self.api_base)
            .field("api_token", &self.token_masked())
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct CreateInstanceRequest {
    name: String,
    image: String,
    cpu_millis: u64,
    memory_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    id: String,
    status: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    agent_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Cloud VM backend talking to the provisioner REST API.
pub struct CloudVmBackend {
    client: Client,
    config: CloudApiConfig,
}

impl CloudVmBackend {
    /// Creates a backend from provisioner configuration.
    pub fn new(config: CloudApiConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client - system TLS configuration error"),
            config,
        }
    }

    fn instances_url(&self) -> String {
        format!("{}/v1/instances", self.config.api_base.trim_end_matches('/'))
    }

    fn instance_url(&self, id: &str) -> String {
        format!("{}/{}", self.instances_url(), id)
    }

    /// Maps a provisioner HTTP status plus error body to the backend taxonomy.
    fn classify_status(code: u16, message: String, id: &str) -> BackendError {
        if message.to_ascii_lowercase().contains("quota") {
            return BackendError::QuotaExceeded(message);
        }
        match code {
            429 => BackendError::RateLimited(message),
            401 | 403 => BackendError::AuthFailed(message),
            400 | 422 => BackendError::InvalidSpec(message),
            404 => BackendError::NotFound { id: id.to_string() },
            _ => BackendError::Api { code, message },
        }
    }

    /// Maps a provisioner instance status string to the harness status.
    fn map_instance_status(status: &str) -> SandboxStatus {
        match status {
            "pending" | "provisioning" | "starting" => SandboxStatus::Pending,
            "running" => SandboxStatus::Running,
            _ => SandboxStatus::Stopped,
        }
    }

    /// Extracts a typed error from a non-success response.
    async fn error_from_response(
        response: reqwest::Response,
        id: &str,
    ) -> BackendError {
        let code = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());

        let message = match serde_json::from_str::<ApiErrorResponse>(&body) {
            Ok(parsed) => parsed.error.message,
            Err(_) => body,
        };

        Self::classify_status(code, message, id)
    }
}

#[async_trait::async_trait]
impl SandboxBackend for CloudVmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudVm
    }

    async fn provision(&self, spec: &SandboxSpec) -> Result<SandboxHandle, BackendError> {
        let request = CreateInstanceRequest {
            name: spec.name.clone(),
            image: spec.image.clone(),
            cpu_millis: spec.resources.cpu_millis,
            memory_bytes: spec.resources.memory_bytes,
            disk_bytes: spec.resources.disk_bytes,
            region: self.config.region.clone(),
            env: spec.env.iter().cloned().collect(),
        };

        debug!(name = %spec.name, image = %spec.image, "requesting instance");
        let response = self
            .client
            .post(self.instances_url())
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response, &spec.name).await);
        }

        let instance: InstanceResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(format!("Failed to parse response: {e}")))?;

        info!(
            instance_id = %instance.id,
            task_id = %spec.task_id,
            status = %instance.status,
            "cloud vm sandbox provisioned"
        );

        Ok(SandboxHandle {
            id: Uuid::new_v4(),
            kind: BackendKind::CloudVm,
            external_id: instance.id,
            endpoint: instance.endpoint,
            auth_token: instance.agent_token,
            created_at: Utc::now(),
        })
    }

    async fn terminate(&self, external_id: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.instance_url(external_id))
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .send()
            .await?;

        if response.status().is_success() {
            info!(external_id = %external_id, "cloud vm sandbox deleted");
            return Ok(());
        }

        match Self::error_from_response(response, external_id).await {
            // Already gone counts as success.
            BackendError::NotFound { .. } => {
                debug!(external_id = %external_id, "instance already gone");
                Ok(())
            }
            other => {
                warn!(external_id = %external_id, error = %other, "instance deletion failed");
                Err(other)
            }
        }
    }

    async fn describe(&self, external_id: &str) -> Result<SandboxStatus, BackendError> {
        let response = self
            .client
            .get(self.instance_url(external_id))
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .send()
            .await?;

        if !response.status().is_success() {
            return match Self::error_from_response(response, external_id).await {
                BackendError::NotFound { .. } => Ok(SandboxStatus::NotFound),
                other => Err(other),
            };
        }

        let instance: InstanceResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(format!("Failed to parse response: {e}")))?;

        Ok(Self::map_instance_status(&instance.status))
    }

    fn channel(&self, handle: &SandboxHandle) -> Result<Box<dyn ExecChannel>, BackendError> {
        let endpoint = handle.endpoint.clone().ok_or_else(|| {
            BackendError::ProvisionFailed(format!(
                "Instance '{}' has no agent endpoint",
                handle.external_id
            ))
        })?;
        let token = handle.auth_token.clone().unwrap_or_default();

        Ok(Box::new(HttpChannel::new(endpoint, token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_is_transient() {
        let err = CloudVmBackend::classify_status(429, "slow down".to_string(), "i-1");
        assert!(matches!(err, BackendError::RateLimited(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_auth_is_permanent() {
        let err = CloudVmBackend::classify_status(403, "token expired".to_string(), "i-1");
        assert!(matches!(err, BackendError::AuthFailed(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_invalid_spec() {
        let err = CloudVmBackend::classify_status(422, "unknown image".to_string(), "i-1");
        assert!(matches!(err, BackendError::InvalidSpec(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_quota_message_wins_over_code() {
        let err =
            CloudVmBackend::classify_status(403, "project quota exhausted".to_string(), "i-1");
        assert!(matches!(err, BackendError::QuotaExceeded(_)));
    }

    #[test]
    fn test_classify_server_error_is_transient() {
        let err = CloudVmBackend::classify_status(503, "maintenance".to_string(), "i-1");
        assert!(err.is_transient());
    }

    #[test]
    fn test_instance_status_mapping() {
        assert_eq!(
            CloudVmBackend::map_instance_status("provisioning"),
            SandboxStatus::Pending
        );
        assert_eq!(
            CloudVmBackend::map_instance_status("running"),
            SandboxStatus::Running
        );
        assert_eq!(
            CloudVmBackend::map_instance_status("terminated"),
            SandboxStatus::Stopped
        );
    }

    #[test]
    fn test_token_masked() {
        let config = CloudApiConfig::new("https://vm.example.net", "tok-12345678abcd");
        assert_eq!(config.token_masked(), "tok-...abcd");

        let short = CloudApiConfig::new("https://vm.example.net", "short");
        assert_eq!(short.token_masked(), "*****");
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = CloudApiConfig::new("https://vm.example.net", "tok-12345678abcd");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("tok-12345678abcd"));
        assert!(rendered.contains("tok-...abcd"));
    }

    #[test]
    fn test_create_request_serialization_skips_empty() {
        let request = CreateInstanceRequest {
            name: "sandfleet-x".to_string(),
            image: "bench/vm:1".to_string(),
            cpu_millis: 2000,
            memory_bytes: 1024,
            disk_bytes: None,
            region: None,
            env: BTreeMap::new(),
        };

        let json = serde_json::to_value(&request).expect("serialization should work");
        assert!(json.get("disk_bytes").is_none());
        assert!(json.get("region").is_none());
        assert!(json.get("env").is_none());
        assert_eq!(json["cpu_millis"], 2000);
    }

    #[test]
    fn test_url_construction_trims_trailing_slash() {
        let backend = CloudVmBackend::new(CloudApiConfig::new("https://vm.example.net/", "t"));
        assert_eq!(backend.instances_url(), "https://vm.example.net/v1/instances");
        assert_eq!(
            backend.instance_url("i-42"),
            "https://vm.example.net/v1/instances/i-42"
        );
    }
}
