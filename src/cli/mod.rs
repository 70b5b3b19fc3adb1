//! Command-line interface for sandfleet.
//!
//! Provides commands for running task manifests across the fleet,
//! reconciling leftover sandboxes, and opening sealed result envelopes.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
