//! Result bundle packing and verification.
//!
//! A bundle aggregates everything a finished task left on disk (attempt
//! logs, downloaded outputs) into one tar.gz archive with a checksum
//! manifest, plus the metadata an analyst needs without unpacking. Bundles
//! only ever cross the trust boundary inside a sealed envelope.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::Builder as TarBuilder;
use uuid::Uuid;
use walkdir::WalkDir;

use super::SealError;
use crate::task::{Task, TaskResult};

/// Name of the checksum manifest inside the archive.
const MANIFEST_NAME: &str = "manifest.json";

mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Checksums of every file carried by the archive.
#[derive(Debug, Serialize, Deserialize)]
struct BundleManifest {
    created_at: DateTime<Utc>,
    /// Relative path -> SHA-256 hex digest.
    files: BTreeMap<String, String>,
}

/// A finished task's artifacts plus the metadata describing them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultBundle {
    /// Task the bundle belongs to.
    pub task_id: Uuid,
    /// Opaque benchmark reference the task carried.
    pub benchmark: String,
    /// Whether the task succeeded.
    pub success: bool,
    /// How many attempts were made.
    pub attempt_count: u32,
    /// When the task reached its terminal status.
    pub completed_at: DateTime<Utc>,
    /// tar.gz archive of the task's artifact tree, manifest included.
    #[serde(with = "b64")]
    pub archive: Vec<u8>,
}

impl ResultBundle {
    /// Packs a task's artifact directory into a bundle.
    pub fn collect(task: &Task, result: &TaskResult, task_dir: &Path) -> Result<Self, SealError> {
        let archive = pack_directory(task_dir)?;
        Ok(Self {
            task_id: result.task_id,
            benchmark: task.benchmark.clone(),
            success: result.is_success(),
            attempt_count: result.attempt_count(),
            completed_at: result.completed_at,
            archive,
        })
    }

    /// Unpacks the archive into `dest` and verifies every checksum.
    pub fn unpack(&self, dest: &Path) -> Result<(), SealError> {
        unpack_archive(&self.archive, dest)?;
        verify_manifest(dest)
    }
}

/// Creates a tar.gz of `dir` with a manifest of per-file checksums.
fn pack_directory(dir: &Path) -> Result<Vec<u8>, SealError> {
    let mut files = BTreeMap::new();
    let mut paths = Vec::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry
            .map_err(|e| SealError::InvalidFormat(format!("walk {}: {}", dir.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        if relative == MANIFEST_NAME {
            continue;
        }

        let data = std::fs::read(entry.path())?;
        files.insert(relative.clone(), sha256_hex(&data));
        paths.push((relative, entry.path().to_path_buf()));
    }

    let manifest = BundleManifest {
        created_at: Utc::now(),
        files,
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

    let enc = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = TarBuilder::new(enc);

    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    tar.append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())?;

    for (relative, path) in &paths {
        tar.append_path_with_name(path, relative)?;
    }

    let enc = tar.into_inner()?;
    Ok(enc.finish()?)
}

/// Unpacks a tar.gz produced by [`pack_directory`] into `dest`.
fn unpack_archive(bytes: &[u8], dest: &Path) -> Result<(), SealError> {
    std::fs::create_dir_all(dest)?;
    let gz = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(gz);
    archive.unpack(dest)?;
    Ok(())
}

/// Rehashes every file named by the manifest in `dir`.
fn verify_manifest(dir: &Path) -> Result<(), SealError> {
    let manifest_path = dir.join(MANIFEST_NAME);
    let manifest_bytes = std::fs::read(&manifest_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SealError::InvalidFormat("bundle has no manifest".to_string())
        } else {
            SealError::Io(e)
        }
    })?;
    let manifest: BundleManifest = serde_json::from_slice(&manifest_bytes)?;

    for (relative, expected) in &manifest.files {
        let path = dir.join(relative);
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SealError::MissingArtifact(relative.clone())
            } else {
                SealError::Io(e)
            }
        })?;

        let actual = sha256_hex(&data);
        if actual != *expected {
            return Err(SealError::ChecksumMismatch {
                path: relative.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{AgentConfig, Attempt, TaskResult};

    fn build_task_dir(root: &Path) {
        std::fs::create_dir_all(root.join("attempt-1/logs")).expect("mkdir");
        std::fs::create_dir_all(root.join("attempt-1/output/report")).expect("mkdir");
        std::fs::write(root.join("attempt-1/logs/agent.log"), b"line one\n").expect("write");
        std::fs::write(root.join("attempt-1/output/report/summary.json"), b"{\"ok\":true}")
            .expect("write");
    }

    fn sample_task() -> Task {
        Task::new(
            "suite/case-03",
            AgentConfig::new("bench/agent:1", vec!["/opt/agent/run".to_string()]),
        )
    }

    fn sample_result(task: &Task) -> TaskResult {
        let attempt = Attempt::succeeded(
            task.id,
            Uuid::new_v4(),
            1,
            Utc::now(),
            0,
            String::new(),
            "/tmp/log".into(),
            "/tmp/out".into(),
        );
        TaskResult::success(task.id, vec![attempt])
    }

    #[test]
    fn test_collect_and_unpack_roundtrip() {
        let work = tempfile::tempdir().expect("temp dir");
        let task_dir = work.path().join("task");
        build_task_dir(&task_dir);

        let task = sample_task();
        let result = sample_result(&task);
        let bundle = ResultBundle::collect(&task, &result, &task_dir).expect("collect");

        assert_eq!(bundle.task_id, task.id);
        assert_eq!(bundle.benchmark, "suite/case-03");
        assert!(bundle.success);
        assert_eq!(bundle.attempt_count, 1);
        assert!(!bundle.archive.is_empty());

        let dest = work.path().join("unpacked");
        bundle.unpack(&dest).expect("unpack should verify");

        let log = std::fs::read(dest.join("attempt-1/logs/agent.log")).expect("read log");
        assert_eq!(log, b"line one\n");
        let report =
            std::fs::read(dest.join("attempt-1/output/report/summary.json")).expect("read report");
        assert_eq!(report, b"{\"ok\":true}");
        assert!(dest.join(MANIFEST_NAME).exists());
    }

    #[test]
    fn test_bundle_serde_preserves_archive_bytes() {
        let work = tempfile::tempdir().expect("temp dir");
        let task_dir = work.path().join("task");
        build_task_dir(&task_dir);

        let task = sample_task();
        let bundle =
            ResultBundle::collect(&task, &sample_result(&task), &task_dir).expect("collect");

        let json = serde_json::to_string(&bundle).expect("serialize");
        let parsed: ResultBundle = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, bundle);
    }

    #[test]
    fn test_verify_detects_modified_artifact() {
        let work = tempfile::tempdir().expect("temp dir");
        let task_dir = work.path().join("task");
        build_task_dir(&task_dir);

        let archive = pack_directory(&task_dir).expect("pack");
        let dest = work.path().join("unpacked");
        unpack_archive(&archive, &dest).expect("unpack");

        std::fs::write(dest.join("attempt-1/logs/agent.log"), b"rewritten\n").expect("tamper");

        let err = verify_manifest(&dest).expect_err("should detect tampering");
        assert!(matches!(err, SealError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_verify_detects_missing_artifact() {
        let work = tempfile::tempdir().expect("temp dir");
        let task_dir = work.path().join("task");
        build_task_dir(&task_dir);

        let archive = pack_directory(&task_dir).expect("pack");
        let dest = work.path().join("unpacked");
        unpack_archive(&archive, &dest).expect("unpack");

        std::fs::remove_file(dest.join("attempt-1/output/report/summary.json")).expect("remove");

        let err = verify_manifest(&dest).expect_err("should detect missing file");
        assert!(matches!(err, SealError::MissingArtifact(_)));
    }

    #[test]
    fn test_empty_directory_packs_cleanly() {
        let work = tempfile::tempdir().expect("temp dir");
        let task_dir = work.path().join("empty");
        std::fs::create_dir_all(&task_dir).expect("mkdir");

        let task = sample_task();
        let bundle =
            ResultBundle::collect(&task, &sample_result(&task), &task_dir).expect("collect");

        let dest = work.path().join("unpacked");
        bundle.unpack(&dest).expect("unpack");
        assert!(dest.join(MANIFEST_NAME).exists());
    }
}
