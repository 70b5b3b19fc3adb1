//! sandfleet: Sandbox fleet orchestrator for agent benchmark tasks.
//!
//! This library provisions isolated sandboxes (local containers or cloud
//! VMs), drives benchmark tasks through their lifecycle with retries, and
//! seals the resulting artifact bundles for tamper-evident storage.

// Core modules
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod lifecycle;
pub mod seal;
pub mod storage;
pub mod task;

// Re-export commonly used error types
pub use error::{BackendError, ExecutorError, FailureKind, LifecycleError, SchedulerError};
pub use seal::SealError;
pub use storage::registry::RegistryError;
