//! Harness configuration.
//!
//! One [`HarnessConfig`] describes a whole run: which backend provisions
//! sandboxes, where attempts persist on disk, how hard to retry, and whether
//! results are sealed. The CLI builds it from `SANDFLEET_*` environment
//! variables and flag overrides, then derives the per-component configs
//! from it so every layer agrees on shared paths.
//!
//! Environment variables:
//!
//! - `SANDFLEET_BACKEND`: "docker" or "cloud" (default "docker")
//! - `SANDFLEET_WORK_ROOT`: attempt staging directory
//! - `SANDFLEET_REGISTRY_PATH`: sqlite file for the sandbox registry
//! - `SANDFLEET_MAX_CONCURRENT`: sandbox cap
//! - `SANDFLEET_MAX_ATTEMPTS`: total attempt budget per task
//! - `SANDFLEET_BACKOFF_BASE_MS` / `SANDFLEET_BACKOFF_CAP_MS`: retry delays
//! - `SANDFLEET_TEARDOWN_ATTEMPTS`: terminate retry budget per sandbox
//! - `SANDFLEET_TEARDOWN_BACKOFF_BASE_MS` / `SANDFLEET_TEARDOWN_BACKOFF_CAP_MS`:
//!   terminate retry delays
//! - `SANDFLEET_CONNECT_TIMEOUT_SECS`: sandbox boot budget
//! - `SANDFLEET_DOCKER_NETWORK`: container network mode
//! - `SANDFLEET_CLOUD_API_BASE` / `SANDFLEET_CLOUD_API_TOKEN` /
//!   `SANDFLEET_CLOUD_REGION`: provisioner API access
//! - `SANDFLEET_SEAL_KEY`: hex seal key; enables result sealing
//! - `SANDFLEET_RETRY_QUOTA_EXHAUSTED`: treat quota errors as retryable
//! - `SANDFLEET_EXTRA_TRANSIENT_STATUS`: comma-separated API status codes
//!   to retry on

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::backend::{BackendKind, CloudApiConfig, DockerBackendConfig};
use crate::error::{BackendError, FailureKind};
use crate::executor::ExecutorConfig;
use crate::fleet::{FleetConfig, RetryPolicy};
use crate::lifecycle::SupervisorConfig;
use crate::seal::{SealKey, KEY_SIZE};

/// Errors raised while assembling or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value the current setup requires is absent.
    #[error("Missing required configuration: {0}")]
    MissingValue(String),

    /// A value was present but unusable.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Overrides widening the default transient/permanent error split.
///
/// [`BackendError::is_transient`] encodes the safe defaults; deployments
/// whose provisioner signals recoverable conditions through other codes can
/// widen the retryable set here without touching classification logic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransienceOverrides {
    /// Extra provisioner API status codes treated as retryable.
    pub extra_transient_status: Vec<u16>,
    /// Treat quota exhaustion as retryable. Quota often frees up again as
    /// other sandboxes in the fleet retire.
    pub retry_quota_exhausted: bool,
}

impl TransienceOverrides {
    /// Whether `error` should be retried, defaults plus overrides.
    pub fn is_transient(&self, error: &BackendError) -> bool {
        if error.is_transient() {
            return true;
        }
        match error {
            BackendError::QuotaExceeded(_) => self.retry_quota_exhausted,
            BackendError::Api { code, .. } => self.extra_transient_status.contains(code),
            _ => false,
        }
    }

    /// Maps `error` into the failure taxonomy under these overrides.
    pub fn failure_kind(&self, error: &BackendError) -> FailureKind {
        if self.is_transient(error) {
            FailureKind::TransientInfrastructure
        } else {
            FailureKind::PermanentConfiguration
        }
    }
}

/// Top-level configuration for one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Which backend provisions sandboxes.
    pub backend: BackendKind,
    /// Directory attempts are staged and persisted under.
    pub work_root: PathBuf,
    /// Sqlite file backing the sandbox registry. Defaults to
    /// `registry.db` under the work root.
    pub registry_path: Option<PathBuf>,
    /// Hard cap on sandboxes alive at once.
    pub max_concurrent_sandboxes: usize,
    /// Attempt budget and backoff timing.
    pub retry: RetryPolicy,
    /// Retry budget and backoff for backend terminate calls.
    pub teardown: RetryPolicy,
    /// Budget for a provisioned sandbox to answer probes, in seconds.
    pub connect_timeout_secs: u64,
    /// Container backend settings.
    pub docker: DockerBackendConfig,
    /// Provisioner API base URL, required for the cloud backend.
    pub cloud_api_base: Option<String>,
    /// Provisioner API token, required for the cloud backend.
    pub cloud_api_token: Option<String>,
    /// Region hint for instance creation.
    pub cloud_region: Option<String>,
    /// Hex-encoded seal key. Present enables sealing.
    pub seal_key_hex: Option<String>,
    /// Error reclassification knobs.
    pub transience: TransienceOverrides,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Container,
            work_root: PathBuf::from("sandfleet-work"),
            registry_path: None,
            max_concurrent_sandboxes: 4,
            retry: RetryPolicy::default(),
            teardown: RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff_bounds_ms(500, 5_000),
            connect_timeout_secs: 120,
            docker: DockerBackendConfig::default(),
            cloud_api_base: None,
            cloud_api_token: None,
            cloud_region: None,
            seal_key_hex: None,
            transience: TransienceOverrides::default(),
        }
    }
}

impl HarnessConfig {
    /// Builds a configuration from `SANDFLEET_*` environment variables,
    /// starting from the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(backend) = parse_var::<BackendKind>("SANDFLEET_BACKEND")? {
            config.backend = backend;
        }
        if let Ok(root) = env::var("SANDFLEET_WORK_ROOT") {
            config.work_root = PathBuf::from(root);
        }
        if let Ok(path) = env::var("SANDFLEET_REGISTRY_PATH") {
            config.registry_path = Some(PathBuf::from(path));
        }
        if let Some(max) = parse_var::<usize>("SANDFLEET_MAX_CONCURRENT")? {
            config.max_concurrent_sandboxes = max;
        }
        if let Some(attempts) = parse_var::<u32>("SANDFLEET_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(base) = parse_var::<u64>("SANDFLEET_BACKOFF_BASE_MS")? {
            config.retry.backoff_base_ms = base;
        }
        if let Some(cap) = parse_var::<u64>("SANDFLEET_BACKOFF_CAP_MS")? {
            config.retry.backoff_cap_ms = cap;
        }
        if let Some(attempts) = parse_var::<u32>("SANDFLEET_TEARDOWN_ATTEMPTS")? {
            config.teardown.max_attempts = attempts;
        }
        if let Some(base) = parse_var::<u64>("SANDFLEET_TEARDOWN_BACKOFF_BASE_MS")? {
            config.teardown.backoff_base_ms = base;
        }
        if let Some(cap) = parse_var::<u64>("SANDFLEET_TEARDOWN_BACKOFF_CAP_MS")? {
            config.teardown.backoff_cap_ms = cap;
        }
        if let Some(secs) = parse_var::<u64>("SANDFLEET_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout_secs = secs;
        }
        if let Ok(network) = env::var("SANDFLEET_DOCKER_NETWORK") {
            config.docker = config.docker.with_network_mode(network);
        }
        config.cloud_api_base = env::var("SANDFLEET_CLOUD_API_BASE").ok();
        config.cloud_api_token = env::var("SANDFLEET_CLOUD_API_TOKEN").ok();
        config.cloud_region = env::var("SANDFLEET_CLOUD_REGION").ok();
        config.seal_key_hex = env::var("SANDFLEET_SEAL_KEY").ok();
        if let Some(retry_quota) = parse_bool_var("SANDFLEET_RETRY_QUOTA_EXHAUSTED")? {
            config.transience.retry_quota_exhausted = retry_quota;
        }
        if let Ok(raw) = env::var("SANDFLEET_EXTRA_TRANSIENT_STATUS") {
            config.transience.extra_transient_status = parse_status_list(&raw)?;
        }

        Ok(config)
    }

    /// Sets the backend kind.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the work root.
    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.work_root = work_root.into();
        self
    }

    /// Sets the sandbox cap.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_sandboxes = max;
        self
    }

    /// Sets the hex seal key.
    pub fn with_seal_key_hex(mut self, hex: impl Into<String>) -> Self {
        self.seal_key_hex = Some(hex.into());
        self
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_sandboxes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDFLEET_MAX_CONCURRENT".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDFLEET_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry.backoff_cap_ms < self.retry.backoff_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "SANDFLEET_BACKOFF_CAP_MS".to_string(),
                message: "cap must not be below the base delay".to_string(),
            });
        }
        if self.teardown.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDFLEET_TEARDOWN_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.teardown.backoff_cap_ms < self.teardown.backoff_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "SANDFLEET_TEARDOWN_BACKOFF_CAP_MS".to_string(),
                message: "cap must not be below the base delay".to_string(),
            });
        }
        if self.backend == BackendKind::CloudVm {
            if self.cloud_api_base.is_none() {
                return Err(ConfigError::MissingValue(
                    "SANDFLEET_CLOUD_API_BASE".to_string(),
                ));
            }
            if self.cloud_api_token.is_none() {
                return Err(ConfigError::MissingValue(
                    "SANDFLEET_CLOUD_API_TOKEN".to_string(),
                ));
            }
        }
        // Surface a malformed key at startup, not at first seal.
        self.seal_key()?;
        Ok(())
    }

    /// Path of the sqlite registry file.
    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| self.work_root.join("registry.db"))
    }

    /// Sqlite connection URL for the registry.
    pub fn registry_url(&self) -> String {
        format!("sqlite://{}", self.registry_path().display())
    }

    /// Decodes the configured seal key, if any.
    pub fn seal_key(&self) -> Result<Option<SealKey>, ConfigError> {
        match self.seal_key_hex.as_deref() {
            None => Ok(None),
            Some(hex) => SealKey::from_hex(hex)
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: "SANDFLEET_SEAL_KEY".to_string(),
                    message: format!("expected {} hex-encoded bytes: {}", KEY_SIZE, e),
                }),
        }
    }

    /// Provisioner API configuration for the cloud backend.
    pub fn cloud_api_config(&self) -> Result<CloudApiConfig, ConfigError> {
        let api_base = self
            .cloud_api_base
            .clone()
            .ok_or_else(|| ConfigError::MissingValue("SANDFLEET_CLOUD_API_BASE".to_string()))?;
        let api_token = self
            .cloud_api_token
            .clone()
            .ok_or_else(|| ConfigError::MissingValue("SANDFLEET_CLOUD_API_TOKEN".to_string()))?;

        let mut config = CloudApiConfig::new(api_base, api_token);
        if let Some(region) = self.cloud_region.clone() {
            config = config.with_region(region);
        }
        Ok(config)
    }

    /// Executor configuration derived from this harness config.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default().with_connect_timeout_secs(self.connect_timeout_secs)
    }

    /// Supervisor configuration derived from this harness config.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            work_root: self.work_root.clone(),
            teardown: self.teardown,
            transience: self.transience.clone(),
        }
    }

    /// Fleet configuration derived from this harness config.
    pub fn fleet_config(&self) -> Result<FleetConfig, ConfigError> {
        let mut fleet = FleetConfig::new(self.max_concurrent_sandboxes)
            .with_retry(self.retry)
            .with_work_root(self.work_root.clone());
        if let Some(key) = self.seal_key()? {
            fleet = fleet.with_seal_key(key);
        }
        Ok(fleet)
    }
}

fn parse_var<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_bool_var(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{}'", other),
            }),
        },
        Err(_) => Ok(None),
    }
}

fn parse_status_list(raw: &str) -> Result<Vec<u16>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                key: "SANDFLEET_EXTRA_TRANSIENT_STATUS".to_string(),
                message: format!("'{}': {}", part, e),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, BackendKind::Container);
        assert_eq!(config.registry_path(), PathBuf::from("sandfleet-work/registry.db"));
        assert!(config.registry_url().starts_with("sqlite://"));
    }

    #[test]
    fn test_cloud_backend_requires_api_access() {
        let config = HarnessConfig::default().with_backend(BackendKind::CloudVm);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingValue(_))
        ));

        let mut config = config;
        config.cloud_api_base = Some("https://vm.example.net".to_string());
        config.cloud_api_token = Some("tok".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = HarnessConfig::default().with_max_concurrent(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_cap_below_base_rejected() {
        let mut config = HarnessConfig::default();
        config.retry.backoff_base_ms = 5_000;
        config.retry.backoff_cap_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_teardown_bounds_validated_and_passed_through() {
        let mut config = HarnessConfig::default();
        config.teardown.backoff_base_ms = 2_000;
        config.teardown.backoff_cap_ms = 200;
        assert!(config.validate().is_err());

        config.teardown.backoff_cap_ms = 4_000;
        assert!(config.validate().is_ok());
        assert_eq!(config.supervisor_config().teardown, config.teardown);
    }

    #[test]
    fn test_seal_key_roundtrip() {
        let hex = "11".repeat(KEY_SIZE);
        let config = HarnessConfig::default().with_seal_key_hex(hex);
        let key = config.seal_key().expect("parse").expect("present");
        assert_eq!(key.key_id().len(), 16);
    }

    #[test]
    fn test_malformed_seal_key_fails_validation() {
        let config = HarnessConfig::default().with_seal_key_hex("deadbeef");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transience_overrides_widen_retryable_set() {
        let defaults = TransienceOverrides::default();
        let quota = BackendError::QuotaExceeded("cpus".to_string());
        let flaky_api = BackendError::Api {
            code: 409,
            message: "conflict".to_string(),
        };
        assert!(!defaults.is_transient(&quota));
        assert!(!defaults.is_transient(&flaky_api));

        let widened = TransienceOverrides {
            extra_transient_status: vec![409],
            retry_quota_exhausted: true,
        };
        assert!(widened.is_transient(&quota));
        assert!(widened.is_transient(&flaky_api));
        assert_eq!(
            widened.failure_kind(&quota),
            FailureKind::TransientInfrastructure
        );

        // Defaults still apply underneath the overrides.
        let auth = BackendError::AuthFailed("expired".to_string());
        assert!(!widened.is_transient(&auth));
        assert!(widened.is_transient(&BackendError::Transport("reset".to_string())));
    }

    #[test]
    fn test_parse_status_list() {
        assert_eq!(parse_status_list("409, 425").expect("parse"), vec![409, 425]);
        assert_eq!(parse_status_list("").expect("parse"), Vec::<u16>::new());
        assert!(parse_status_list("409,abc").is_err());
    }

    #[test]
    fn test_derived_configs_share_work_root() {
        let config = HarnessConfig::default().with_work_root("/data/fleet");
        let supervisor = config.supervisor_config();
        let fleet = config.fleet_config().expect("fleet config");
        assert_eq!(supervisor.work_root, PathBuf::from("/data/fleet"));
        assert_eq!(fleet.work_root, PathBuf::from("/data/fleet"));
    }
}
