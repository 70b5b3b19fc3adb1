//! Sandbox lifecycle state machine.
//!
//! This module defines the states a sandbox moves through and the record the
//! supervisor drives through them:
//!
//! - `SandboxState`: the state machine with its legal transitions
//! - `SandboxRecord`: one sandbox's identity, handle and current state
//! - `supervisor`: runs a single attempt through the full lifecycle
//! - `reconcile`: startup cleanup of sandboxes a previous run left behind
//!
//! Every state change goes through [`SandboxRecord::transition`], which
//! rejects anything the matrix does not allow. Teardown is reachable from
//! every live state so cancellation can always make progress.

pub mod reconcile;
pub mod supervisor;

pub use reconcile::{ReconcileReport, Reconciler};
pub use supervisor::{AttemptSupervisor, SupervisorConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{BackendKind, SandboxHandle};
use crate::error::LifecycleError;

/// States a sandbox moves through from request to retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// A slot was claimed; nothing exists at the backend yet.
    Requested,
    /// The backend provision call is in flight.
    Provisioning,
    /// A handle exists; waiting for the readiness probe to pass.
    Booting,
    /// The sandbox answers probes and can accept work.
    Ready,
    /// The agent entry point is running.
    Executing,
    /// The agent finished with a zero exit status.
    Succeeded,
    /// The agent or the infrastructure around it failed.
    Failed,
    /// The backend terminate call is in flight or being retried.
    TearingDown,
    /// The backend resource is confirmed gone. Final.
    Terminated,
    /// Provisioning or boot never produced a usable sandbox.
    ProvisionError,
    /// Found in the registry at startup with no live owner.
    Orphaned,
}

impl SandboxState {
    /// Whether no further lifecycle work is required for this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxState::Terminated)
    }

    /// Whether the machine allows moving from this state to `next`.
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // Reconciliation may claim any live row it finds.
            (_, Orphaned) => *self != Orphaned,
            // Teardown is unconditional from every live state.
            (_, TearingDown) => *self != TearingDown,
            (Requested, Provisioning) => true,
            (Provisioning, Booting) | (Provisioning, ProvisionError) => true,
            (Booting, Ready) | (Booting, ProvisionError) => true,
            (Ready, Executing) => true,
            (Executing, Succeeded) | (Executing, Failed) => true,
            (TearingDown, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxState::Requested => "requested",
            SandboxState::Provisioning => "provisioning",
            SandboxState::Booting => "booting",
            SandboxState::Ready => "ready",
            SandboxState::Executing => "executing",
            SandboxState::Succeeded => "succeeded",
            SandboxState::Failed => "failed",
            SandboxState::TearingDown => "tearing_down",
            SandboxState::Terminated => "terminated",
            SandboxState::ProvisionError => "provision_error",
            SandboxState::Orphaned => "orphaned",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SandboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(SandboxState::Requested),
            "provisioning" => Ok(SandboxState::Provisioning),
            "booting" => Ok(SandboxState::Booting),
            "ready" => Ok(SandboxState::Ready),
            "executing" => Ok(SandboxState::Executing),
            "succeeded" => Ok(SandboxState::Succeeded),
            "failed" => Ok(SandboxState::Failed),
            "tearing_down" => Ok(SandboxState::TearingDown),
            "terminated" => Ok(SandboxState::Terminated),
            "provision_error" => Ok(SandboxState::ProvisionError),
            "orphaned" => Ok(SandboxState::Orphaned),
            other => Err(format!("unknown sandbox state '{}'", other)),
        }
    }
}

/// One sandbox's identity and lifecycle position.
///
/// Owned exclusively by the supervisor driving it; nothing else mutates a
/// record. The scheduler only ever sees the attempt that comes out the far
/// end.
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    /// Harness-side sandbox identifier.
    pub id: Uuid,
    /// Task this sandbox was provisioned for.
    pub task_id: Uuid,
    /// Which backend owns the real resource.
    pub backend: BackendKind,
    /// Current lifecycle state.
    pub state: SandboxState,
    /// 1-based attempt this sandbox serves.
    pub attempt: u32,
    /// Backend handle, present once provisioning returned one.
    pub handle: Option<SandboxHandle>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the last transition happened.
    pub last_transition_at: DateTime<Utc>,
}

impl SandboxRecord {
    /// Creates a record in `Requested` for the given task attempt.
    pub fn new(task_id: Uuid, backend: BackendKind, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            backend,
            state: SandboxState::Requested,
            attempt,
            handle: None,
            created_at: now,
            last_transition_at: now,
        }
    }

    /// Moves the record to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: SandboxState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(
            sandbox_id = %self.id,
            task_id = %self.task_id,
            from = %self.state,
            to = %next,
            "sandbox state transition"
        );
        self.state = next;
        self.last_transition_at = Utc::now();
        Ok(())
    }

    /// Backend-native identifier, empty until a handle exists.
    pub fn external_id(&self) -> &str {
        self.handle.as_ref().map(|h| h.external_id.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SandboxRecord {
        SandboxRecord::new(Uuid::new_v4(), BackendKind::Container, 1)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut r = record();
        for next in [
            SandboxState::Provisioning,
            SandboxState::Booting,
            SandboxState::Ready,
            SandboxState::Executing,
            SandboxState::Succeeded,
            SandboxState::TearingDown,
            SandboxState::Terminated,
        ] {
            r.transition(next).expect("transition should be legal");
        }
        assert!(r.state.is_terminal());
    }

    #[test]
    fn test_boot_timeout_path() {
        let mut r = record();
        r.transition(SandboxState::Provisioning).expect("legal");
        r.transition(SandboxState::Booting).expect("legal");
        r.transition(SandboxState::ProvisionError).expect("legal");
        r.transition(SandboxState::TearingDown).expect("legal");
        r.transition(SandboxState::Terminated).expect("legal");
    }

    #[test]
    fn test_teardown_reachable_from_every_live_state() {
        for state in [
            SandboxState::Requested,
            SandboxState::Provisioning,
            SandboxState::Booting,
            SandboxState::Ready,
            SandboxState::Executing,
            SandboxState::Succeeded,
            SandboxState::Failed,
            SandboxState::ProvisionError,
            SandboxState::Orphaned,
        ] {
            assert!(
                state.can_transition_to(SandboxState::TearingDown),
                "{} should allow teardown",
                state
            );
        }
    }

    #[test]
    fn test_terminated_is_a_sink() {
        for next in [
            SandboxState::Requested,
            SandboxState::Provisioning,
            SandboxState::TearingDown,
            SandboxState::Orphaned,
        ] {
            assert!(!SandboxState::Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut r = record();
        let err = r
            .transition(SandboxState::Executing)
            .expect_err("requested cannot jump to executing");
        assert!(matches!(err, LifecycleError::IllegalTransition { .. }));
        assert_eq!(r.state, SandboxState::Requested);
    }

    #[test]
    fn test_skipping_ready_is_rejected() {
        let mut r = record();
        r.transition(SandboxState::Provisioning).expect("legal");
        r.transition(SandboxState::Booting).expect("legal");
        assert!(r.transition(SandboxState::Executing).is_err());
    }

    #[test]
    fn test_state_parse_roundtrip() {
        for state in [
            SandboxState::Requested,
            SandboxState::Provisioning,
            SandboxState::Booting,
            SandboxState::Ready,
            SandboxState::Executing,
            SandboxState::Succeeded,
            SandboxState::Failed,
            SandboxState::TearingDown,
            SandboxState::Terminated,
            SandboxState::ProvisionError,
            SandboxState::Orphaned,
        ] {
            let parsed: SandboxState = state.to_string().parse().expect("parse");
            assert_eq!(parsed, state);
        }
        assert!("warming_up".parse::<SandboxState>().is_err());
    }

    #[test]
    fn test_external_id_defaults_empty() {
        let r = record();
        assert_eq!(r.external_id(), "");
    }
}
