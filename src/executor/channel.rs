//! Execution channels into booted sandboxes.
//!
//! A channel is the only path into a sandbox: readiness probe, payload
//! upload, entry-point execution with streamed output, artifact download and
//! forced kill. Containers get a [`DockerChannel`] over the daemon's exec and
//! archive APIs; cloud VMs get an [`HttpChannel`] speaking the authenticated
//! JSON protocol of the agent service baked into the VM image.

use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    DownloadFromContainerOptions, InspectContainerOptions, KillContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExecutorError;
use crate::executor::LogSink;

/// Capability interface of an execution channel into one sandbox.
#[async_trait]
pub trait ExecChannel: Send + Sync {
    /// Whether the sandbox is ready to accept work. Not-ready is a normal
    /// answer while the sandbox boots, not an error.
    async fn probe(&self) -> Result<bool, ExecutorError>;

    /// Uploads a local directory tree to `dest` inside the sandbox.
    async fn upload(&self, local_dir: &Path, dest: &str) -> Result<(), ExecutorError>;

    /// Runs a command, streaming combined stdout/stderr into `sink`.
    /// Returns the command's exit code.
    async fn exec(
        &self,
        cmd: &[String],
        env: &[(String, String)],
        sink: &mut LogSink,
    ) -> Result<i64, ExecutorError>;

    /// Downloads the remote directory `src` into `local_dir`.
    async fn download(&self, src: &str, local_dir: &Path) -> Result<(), ExecutorError>;

    /// Forcefully stops whatever the channel started. Safe to call twice.
    async fn kill(&self) -> Result<(), ExecutorError>;
}

/// Packs a directory tree into an uncompressed tar archive in memory.
pub(crate) fn tar_directory(dir: &Path) -> Result<Vec<u8>, ExecutorError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", dir)
        .map_err(|e| ExecutorError::UploadFailed(format!("Failed to pack '{}': {e}", dir.display())))?;
    builder
        .into_inner()
        .map_err(|e| ExecutorError::UploadFailed(format!("Failed to finish archive: {e}")))
}

/// Channel into a container sandbox via the Docker daemon.
pub struct DockerChannel {
    docker: Docker,
    container_id: String,
    working_dir: String,
}

impl DockerChannel {
    /// Creates a channel for a running container.
    pub fn new(docker: Docker, container_id: String, working_dir: String) -> Self {
        Self {
            docker,
            container_id,
            working_dir,
        }
    }

    /// Runs a helper command without capturing its output.
    async fn run_silent(&self, cmd: Vec<String>) -> Result<i64, ExecutorError> {
        let mut sink = LogSink::in_memory();
        self.exec_streaming(&cmd, &[], &mut sink).await
    }

    async fn exec_streaming(
        &self,
        cmd: &[String],
        env: &[(String, String)],
        sink: &mut LogSink,
    ) -> Result<i64, ExecutorError> {
        let env_strings: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let exec_options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            env: if env_strings.is_empty() {
                None
            } else {
                Some(env_strings)
            },
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(self.working_dir.clone()),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&self.container_id, exec_options)
            .await
            .map_err(|e| ExecutorError::ChannelClosed(format!("Failed to create exec: {e}")))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ExecutorError::ChannelClosed(format!("Failed to start exec: {e}")))?;

        if let StartExecResults::Attached { mut output, .. } = start_result {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(log_output) => sink.write(&log_output.into_bytes())?,
                    Err(e) => {
                        return Err(ExecutorError::ChannelClosed(format!(
                            "Error reading output: {e}"
                        )))
                    }
                }
            }
        }

        let exec_info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ExecutorError::ChannelClosed(format!("Failed to inspect exec: {e}")))?;

        Ok(exec_info.exit_code.unwrap_or(-1))
    }
}

#[async_trait]
impl ExecChannel for DockerChannel {
    async fn probe(&self) -> Result<bool, ExecutorError> {
        match self
            .docker
            .inspect_container(&self.container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(e) => {
                debug!(container = %self.container_id, error = %e, "probe inspect failed");
                Ok(false)
            }
        }
    }

    async fn upload(&self, local_dir: &Path, dest: &str) -> Result<(), ExecutorError> {
        let archive = tar_directory(local_dir)?;

        self.run_silent(vec![
            "mkdir".to_string(),
            "-p".to_string(),
            dest.to_string(),
        ])
        .await?;

        let options = UploadToContainerOptions {
            path: dest.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(&self.container_id, Some(options), archive.into())
            .await
            .map_err(|e| ExecutorError::UploadFailed(format!("Archive upload failed: {e}")))
    }

    async fn exec(
        &self,
        cmd: &[String],
        env: &[(String, String)],
        sink: &mut LogSink,
    ) -> Result<i64, ExecutorError> {
        self.exec_streaming(cmd, env, sink).await
    }

    async fn download(&self, src: &str, local_dir: &Path) -> Result<(), ExecutorError> {
        let options = DownloadFromContainerOptions {
            path: src.to_string(),
        };
        let mut stream = self
            .docker
            .download_from_container(&self.container_id, Some(options));

        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| ExecutorError::DownloadFailed(format!("Archive read failed: {e}")))?;
            bytes.extend_from_slice(&chunk);
        }

        tar::Archive::new(bytes.as_slice())
            .unpack(local_dir)
            .map_err(|e| ExecutorError::DownloadFailed(format!("Archive unpack failed: {e}")))
    }

    async fn kill(&self) -> Result<(), ExecutorError> {
        match self
            .docker
            .kill_container(&self.container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                // Already stopped or already gone both count as killed.
                if msg.contains("is not running") || msg.contains("No such container") {
                    Ok(())
                } else {
                    Err(ExecutorError::KillFailed(msg))
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    cmd: &'a [String],
    env: &'a [(String, String)],
}

#[derive(Debug, Deserialize)]
struct ExecEvent {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    exit_code: Option<i64>,
}

/// Request timeout for non-streaming agent service calls in seconds.
const SERVICE_TIMEOUT_SECS: u64 = 60;

/// Channel into a VM sandbox via its in-image agent service.
///
/// The service exposes `/healthz`, `/v1/payload`, `/v1/exec` (newline
/// delimited JSON event stream), `/v1/artifacts` and `/v1/kill`, all behind
/// the bearer token minted at provisioning time.
pub struct HttpChannel {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpChannel {
    /// Creates a channel for a provisioned VM endpoint.
    pub fn new(endpoint: String, token: String) -> Self {
        Self {
            // No client-level timeout: exec streams for the task's whole
            // wall clock. Short calls set per-request timeouts instead.
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

#[async_trait]
impl ExecChannel for HttpChannel {
    async fn probe(&self) -> Result<bool, ExecutorError> {
        let result = self
            .client
            .get(self.url("/healthz"))
            .header("Authorization", self.auth_header())
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await;

        match result {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "probe failed");
                Ok(false)
            }
        }
    }

    async fn upload(&self, local_dir: &Path, dest: &str) -> Result<(), ExecutorError> {
        let archive = tar_directory(local_dir)?;

        let response = self
            .client
            .post(self.url("/v1/payload"))
            .header("Authorization", self.auth_header())
            .query(&[("dest", dest)])
            .timeout(std::time::Duration::from_secs(SERVICE_TIMEOUT_SECS))
            .body(archive)
            .send()
            .await
            .map_err(|e| ExecutorError::UploadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecutorError::UploadFailed(format!(
                "Payload upload returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn exec(
        &self,
        cmd: &[String],
        env: &[(String, String)],
        sink: &mut LogSink,
    ) -> Result<i64, ExecutorError> {
        let mut response = self
            .client
            .post(self.url("/v1/exec"))
            .header("Authorization", self.auth_header())
            .json(&ExecRequest { cmd, env })
            .send()
            .await
            .map_err(|e| ExecutorError::ChannelClosed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecutorError::Protocol(format!(
                "Exec returned {}",
                response.status()
            )));
        }

        let mut buf: Vec<u8> = Vec::new();
        let mut exit_code = None;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ExecutorError::ChannelClosed(e.to_string()))?
        {
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }

                let event: ExecEvent = serde_json::from_slice(line)?;
                if let Some(data) = event.data {
                    sink.write(data.as_bytes())?;
                }
                if let Some(code) = event.exit_code {
                    exit_code = Some(code);
                }
                // The stream field exists for consumers that split streams;
                // the attempt log keeps them combined.
                let _ = event.stream;
            }
        }

        exit_code
            .ok_or_else(|| ExecutorError::ChannelClosed("stream ended without exit event".into()))
    }

    async fn download(&self, src: &str, local_dir: &Path) -> Result<(), ExecutorError> {
        let response = self
            .client
            .get(self.url("/v1/artifacts"))
            .header("Authorization", self.auth_header())
            .query(&[("path", src)])
            .timeout(std::time::Duration::from_secs(SERVICE_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| ExecutorError::DownloadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecutorError::DownloadFailed(format!(
                "Artifact download returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExecutorError::DownloadFailed(e.to_string()))?;

        tar::Archive::new(bytes.as_ref())
            .unpack(local_dir)
            .map_err(|e| ExecutorError::DownloadFailed(format!("Archive unpack failed: {e}")))
    }

    async fn kill(&self) -> Result<(), ExecutorError> {
        let response = self
            .client
            .post(self.url("/v1/kill"))
            .header("Authorization", self.auth_header())
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ExecutorError::KillFailed(e.to_string()))?;

        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(ExecutorError::KillFailed(format!(
                "Kill returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_directory_roundtrip() {
        let src = tempfile::tempdir().expect("create temp dir");
        std::fs::write(src.path().join("task.json"), b"{\"id\":1}").expect("write file");
        std::fs::create_dir(src.path().join("sub")).expect("create subdir");
        std::fs::write(src.path().join("sub/data.txt"), b"payload").expect("write nested");

        let archive = tar_directory(src.path()).expect("pack should succeed");
        assert!(!archive.is_empty());

        let dst = tempfile::tempdir().expect("create temp dir");
        tar::Archive::new(archive.as_slice())
            .unpack(dst.path())
            .expect("unpack should succeed");

        let restored = std::fs::read(dst.path().join("task.json")).expect("read restored");
        assert_eq!(restored, b"{\"id\":1}");
        let nested = std::fs::read(dst.path().join("sub/data.txt")).expect("read nested");
        assert_eq!(nested, b"payload");
    }

    #[test]
    fn test_exec_event_parsing() {
        let data: ExecEvent =
            serde_json::from_str(r#"{"stream":"stdout","data":"hello\n"}"#).expect("parse");
        assert_eq!(data.stream.as_deref(), Some("stdout"));
        assert_eq!(data.data.as_deref(), Some("hello\n"));
        assert!(data.exit_code.is_none());

        let done: ExecEvent = serde_json::from_str(r#"{"exit_code":0}"#).expect("parse");
        assert_eq!(done.exit_code, Some(0));
        assert!(done.data.is_none());
    }

    #[test]
    fn test_http_channel_url_building() {
        let channel = HttpChannel::new("http://10.0.0.5:8080/".to_string(), "tok".to_string());
        assert_eq!(channel.url("/healthz"), "http://10.0.0.5:8080/healthz");
        assert_eq!(channel.url("/v1/exec"), "http://10.0.0.5:8080/v1/exec");
        assert_eq!(channel.auth_header(), "Bearer tok");
    }

    #[test]
    fn test_exec_request_serialization() {
        let cmd = vec!["/opt/agent/run".to_string()];
        let env = vec![("CASE".to_string(), "17".to_string())];
        let request = ExecRequest {
            cmd: &cmd,
            env: &env,
        };

        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["cmd"][0], "/opt/agent/run");
        assert_eq!(json["env"][0][0], "CASE");
    }
}
