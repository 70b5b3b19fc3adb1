//! Attempt-scoped artifact storage.
//!
//! Every attempt gets its own directory tree under the work root:
//! `<root>/<task-id>/attempt-<n>/{logs,payload,output}`. The scope acts as a
//! guard: dropping it removes the tree unless the attempt was persisted, so
//! abandoned attempts never leave partial files behind.

pub mod registry;

pub use registry::{RegistryError, SandboxRegistry, SandboxRow};

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Errors that can occur while managing attempt storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Attempt directory creation failed.
    #[error("Failed to create attempt directory: {0}")]
    DirectoryCreationFailed(String),
}

/// On-disk staging area for one attempt.
///
/// Removed on drop unless [`persist`](AttemptScope::persist) was called.
pub struct AttemptScope {
    root: PathBuf,
    persisted: bool,
}

impl AttemptScope {
    /// Creates the directory tree for an attempt.
    pub fn create(
        work_root: &Path,
        task_id: Uuid,
        attempt_index: u32,
    ) -> Result<Self, StorageError> {
        let root = work_root
            .join(task_id.to_string())
            .join(format!("attempt-{}", attempt_index));

        for sub in ["logs", "payload", "output"] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| {
                StorageError::DirectoryCreationFailed(format!("{}: {}", dir.display(), e))
            })?;
        }

        Ok(Self {
            root,
            persisted: false,
        })
    }

    /// Root of the attempt tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding files sent to the sandbox.
    pub fn payload_dir(&self) -> PathBuf {
        self.root.join("payload")
    }

    /// Directory the remote output is downloaded into.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Directory holding attempt logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Path of the combined agent output log.
    pub fn log_path(&self) -> PathBuf {
        self.root.join("logs").join("agent.log")
    }

    /// Keeps the tree on drop.
    pub fn persist(&mut self) {
        self.persisted = true;
    }

    /// Whether the tree survives drop.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }
}

impl Drop for AttemptScope {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.root.display(), error = %e, "failed to remove attempt directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_creates_subdirectories() {
        let work = tempfile::tempdir().expect("temp dir");
        let task_id = Uuid::new_v4();

        let scope = AttemptScope::create(work.path(), task_id, 1).expect("create scope");
        assert!(scope.payload_dir().is_dir());
        assert!(scope.output_dir().is_dir());
        assert!(scope.logs_dir().is_dir());
        assert!(scope.root().starts_with(work.path()));
    }

    #[test]
    fn test_scope_removed_on_drop() {
        let work = tempfile::tempdir().expect("temp dir");
        let task_id = Uuid::new_v4();

        let root = {
            let scope = AttemptScope::create(work.path(), task_id, 1).expect("create scope");
            std::fs::write(scope.payload_dir().join("task.json"), b"{}").expect("write");
            scope.root().to_path_buf()
        };

        assert!(!root.exists());
    }

    #[test]
    fn test_persisted_scope_survives_drop() {
        let work = tempfile::tempdir().expect("temp dir");
        let task_id = Uuid::new_v4();

        let root = {
            let mut scope = AttemptScope::create(work.path(), task_id, 2).expect("create scope");
            scope.persist();
            assert!(scope.is_persisted());
            scope.root().to_path_buf()
        };

        assert!(root.exists());
        assert!(root.ends_with(format!("{}/attempt-2", task_id)));
    }

    #[test]
    fn test_attempts_do_not_collide() {
        let work = tempfile::tempdir().expect("temp dir");
        let task_id = Uuid::new_v4();

        let first = AttemptScope::create(work.path(), task_id, 1).expect("first");
        let second = AttemptScope::create(work.path(), task_id, 2).expect("second");
        assert_ne!(first.root(), second.root());
    }
}
