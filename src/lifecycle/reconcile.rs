//! Startup reconciliation of sandboxes left behind by a previous run.
//!
//! A crash can leave registry rows in any live state, with or without a
//! backend resource behind them. Reconciliation walks every live row, claims
//! it as orphaned and issues an idempotent terminate; rows whose terminate
//! keeps failing stay live so the next pass retries. Rows that never got an
//! external id are retired directly, and a closing sweep asks the backend
//! for labeled leftovers no surviving row tracks, reclaiming resources
//! created in the window before their row learned an external id.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::SandboxBackend;
use crate::lifecycle::SandboxState;
use crate::storage::registry::{RegistryError, SandboxRegistry};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Live rows found in the registry.
    pub examined: usize,
    /// Resources confirmed terminated this pass.
    pub terminated: usize,
    /// Rows retired without a terminate call for lack of an external id.
    pub untracked: usize,
    /// Rows whose terminate failed; they stay live for the next pass.
    pub unreachable: usize,
    /// Rows owned by a different backend kind than this reconciler's.
    pub skipped: usize,
    /// Labeled backend resources removed that no row tracked.
    pub swept: usize,
}

impl std::fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "examined {} live sandboxes: {} terminated, {} untracked, {} unreachable, \
             {} skipped; {} leftover resources swept",
            self.examined,
            self.terminated,
            self.untracked,
            self.unreachable,
            self.skipped,
            self.swept
        )
    }
}

/// Sweeps the registry for sandboxes without a live owner.
pub struct Reconciler {
    backend: Arc<dyn SandboxBackend>,
    registry: Arc<SandboxRegistry>,
}

impl Reconciler {
    pub fn new(backend: Arc<dyn SandboxBackend>, registry: Arc<SandboxRegistry>) -> Self {
        Self { backend, registry }
    }

    /// Runs one pass over every live registry row, then sweeps the backend
    /// for labeled leftovers none of those rows track.
    pub async fn run(&self) -> Result<ReconcileReport, RegistryError> {
        let rows = self.registry.live().await?;
        let mut report = ReconcileReport {
            examined: rows.len(),
            ..ReconcileReport::default()
        };

        if !rows.is_empty() {
            info!(count = rows.len(), "reconciling live sandbox rows");
        }

        // External ids the registry still accounts for; the sweep spares
        // these even when their terminate failed this pass.
        let known: Vec<String> = rows
            .iter()
            .filter(|r| r.backend == self.backend.kind() && !r.external_id.is_empty())
            .map(|r| r.external_id.clone())
            .collect();

        for row in rows {
            if row.backend != self.backend.kind() {
                warn!(
                    sandbox_id = %row.id,
                    row_backend = %row.backend,
                    "row belongs to another backend, skipping"
                );
                report.skipped += 1;
                continue;
            }

            if row.external_id.is_empty() {
                // The row was written before provisioning produced a handle.
                // Any resource created in that window carries the managed
                // label and is reclaimed by the sweep below.
                warn!(
                    sandbox_id = %row.id,
                    task_id = %row.task_id,
                    state = %row.state,
                    "retiring sandbox row with no external id"
                );
                self.update(row.id, SandboxState::TearingDown).await;
                self.update(row.id, SandboxState::Terminated).await;
                report.untracked += 1;
                continue;
            }

            if row.state != SandboxState::Orphaned {
                self.update(row.id, SandboxState::Orphaned).await;
            }
            self.update(row.id, SandboxState::TearingDown).await;

            match self.backend.terminate(&row.external_id).await {
                Ok(()) => {
                    self.update(row.id, SandboxState::Terminated).await;
                    info!(
                        sandbox_id = %row.id,
                        external_id = %row.external_id,
                        "orphaned sandbox terminated"
                    );
                    report.terminated += 1;
                }
                Err(e) => {
                    warn!(
                        sandbox_id = %row.id,
                        external_id = %row.external_id,
                        error = %e,
                        "orphan terminate failed, leaving row for the next pass"
                    );
                    report.unreachable += 1;
                }
            }
        }

        match self.backend.sweep_orphans(&known).await {
            Ok(count) => {
                if count > 0 {
                    info!(count = count, "swept untracked backend resources");
                }
                report.swept = count;
            }
            Err(e) => {
                warn!(error = %e, "leftover sweep failed, leaving it to the next pass");
            }
        }

        Ok(report)
    }

    async fn update(&self, id: Uuid, state: SandboxState) {
        if let Err(e) = self.registry.update_state(id, state).await {
            warn!(
                sandbox_id = %id,
                target = %state,
                error = %e,
                "registry update failed during reconciliation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, SandboxHandle, SandboxSpec, SandboxStatus};
    use crate::error::{BackendError, ExecutorError};
    use crate::executor::channel::ExecChannel;
    use crate::storage::registry::SandboxRow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ReapOnlyBackend {
        terminate_calls: AtomicU32,
        terminate_fails: AtomicBool,
        /// Resource ids the backend would report for a label-filtered listing.
        discoverable: Mutex<Vec<String>>,
        /// Resource ids the sweep removed.
        swept: Mutex<Vec<String>>,
    }

    impl ReapOnlyBackend {
        fn new() -> Self {
            Self {
                terminate_calls: AtomicU32::new(0),
                terminate_fails: AtomicBool::new(false),
                discoverable: Mutex::new(Vec::new()),
                swept: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SandboxBackend for ReapOnlyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Container
        }

        async fn provision(&self, _spec: &SandboxSpec) -> Result<SandboxHandle, BackendError> {
            Err(BackendError::ProvisionFailed("not under test".into()))
        }

        async fn terminate(&self, _external_id: &str) -> Result<(), BackendError> {
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            if self.terminate_fails.load(Ordering::SeqCst) {
                return Err(BackendError::Transport("daemon unreachable".into()));
            }
            Ok(())
        }

        async fn sweep_orphans(&self, known_ids: &[String]) -> Result<usize, BackendError> {
            let leftovers: Vec<String> = self
                .discoverable
                .lock()
                .unwrap()
                .iter()
                .filter(|id| !known_ids.contains(id))
                .cloned()
                .collect();
            self.swept.lock().unwrap().extend(leftovers.iter().cloned());
            Ok(leftovers.len())
        }

        async fn describe(&self, _external_id: &str) -> Result<SandboxStatus, BackendError> {
            Ok(SandboxStatus::NotFound)
        }

        fn channel(&self, _handle: &SandboxHandle) -> Result<Box<dyn ExecChannel>, BackendError> {
            Err(BackendError::ProvisionFailed("not under test".into()))
        }
    }

    async fn seed_row(
        registry: &SandboxRegistry,
        state: SandboxState,
        external_id: &str,
    ) -> SandboxRow {
        let row = SandboxRow::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            BackendKind::Container,
            state,
        )
        .with_external_id(external_id);
        registry.save(&row).await.expect("seed row");
        row
    }

    #[tokio::test]
    async fn test_reconcile_terminates_live_rows() {
        let registry = Arc::new(SandboxRegistry::in_memory().await.expect("registry"));
        let backend = Arc::new(ReapOnlyBackend::new());
        seed_row(&registry, SandboxState::Executing, "box-1").await;
        seed_row(&registry, SandboxState::Booting, "box-2").await;

        let report = Reconciler::new(backend.clone(), registry.clone())
            .run()
            .await
            .expect("reconcile");

        assert_eq!(report.examined, 2);
        assert_eq!(report.terminated, 2);
        assert_eq!(backend.terminate_calls.load(Ordering::SeqCst), 2);
        assert!(registry.live().await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_retires_rows_without_external_id() {
        let registry = Arc::new(SandboxRegistry::in_memory().await.expect("registry"));
        let backend = Arc::new(ReapOnlyBackend::new());
        let row = seed_row(&registry, SandboxState::Provisioning, "").await;

        let report = Reconciler::new(backend.clone(), registry.clone())
            .run()
            .await
            .expect("reconcile");

        assert_eq!(report.untracked, 1);
        assert_eq!(report.terminated, 0);
        // Retiring the row makes no backend calls; reclaiming whatever the
        // row never learned about is the sweep's job.
        assert_eq!(backend.terminate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.swept, 0);

        let stored = registry.get(row.id).await.expect("query").expect("row");
        assert_eq!(stored.state, SandboxState::Terminated);
    }

    #[tokio::test]
    async fn test_reconcile_sweeps_resources_unknown_to_registry() {
        let registry = Arc::new(SandboxRegistry::in_memory().await.expect("registry"));
        let backend = Arc::new(ReapOnlyBackend::new());
        // A crash mid-provision leaves a row with no external id while the
        // container it was creating is already up, labeled but untracked.
        let row = seed_row(&registry, SandboxState::Provisioning, "").await;
        backend.discoverable.lock().unwrap().push("box-lost".to_string());

        let report = Reconciler::new(backend.clone(), registry.clone())
            .run()
            .await
            .expect("reconcile");

        assert_eq!(report.untracked, 1);
        assert_eq!(report.swept, 1);
        assert_eq!(*backend.swept.lock().unwrap(), vec!["box-lost".to_string()]);

        let stored = registry.get(row.id).await.expect("query").expect("row");
        assert_eq!(stored.state, SandboxState::Terminated);
    }

    #[tokio::test]
    async fn test_sweep_spares_resources_with_registry_rows() {
        let registry = Arc::new(SandboxRegistry::in_memory().await.expect("registry"));
        let backend = Arc::new(ReapOnlyBackend::new());
        seed_row(&registry, SandboxState::Executing, "box-1").await;
        backend.discoverable.lock().unwrap().push("box-1".to_string());

        let report = Reconciler::new(backend.clone(), registry.clone())
            .run()
            .await
            .expect("reconcile");

        // The row pass already terminated box-1; the sweep must not touch it.
        assert_eq!(report.terminated, 1);
        assert_eq!(report.swept, 0);
        assert!(backend.swept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_runs_even_without_live_rows() {
        let registry = Arc::new(SandboxRegistry::in_memory().await.expect("registry"));
        let backend = Arc::new(ReapOnlyBackend::new());
        backend.discoverable.lock().unwrap().push("box-leak".to_string());

        let report = Reconciler::new(backend.clone(), registry.clone())
            .run()
            .await
            .expect("reconcile");

        assert_eq!(report.examined, 0);
        assert_eq!(report.swept, 1);
        assert_eq!(*backend.swept.lock().unwrap(), vec!["box-leak".to_string()]);
    }

    #[tokio::test]
    async fn test_reconcile_skips_foreign_backend_rows() {
        let registry = Arc::new(SandboxRegistry::in_memory().await.expect("registry"));
        let backend = Arc::new(ReapOnlyBackend::new());
        let row = SandboxRow::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            BackendKind::CloudVm,
            SandboxState::Executing,
        )
        .with_external_id("vm-1");
        registry.save(&row).await.expect("seed row");

        let report = Reconciler::new(backend.clone(), registry.clone())
            .run()
            .await
            .expect("reconcile");

        assert_eq!(report.skipped, 1);
        assert_eq!(backend.terminate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.live().await.expect("query").len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_rows_retry_on_next_pass() {
        let registry = Arc::new(SandboxRegistry::in_memory().await.expect("registry"));
        let backend = Arc::new(ReapOnlyBackend::new());
        backend.terminate_fails.store(true, Ordering::SeqCst);
        let row = seed_row(&registry, SandboxState::Executing, "box-1").await;

        let reconciler = Reconciler::new(backend.clone(), registry.clone());
        let report = reconciler.run().await.expect("reconcile");
        assert_eq!(report.unreachable, 1);

        let stored = registry.get(row.id).await.expect("query").expect("row");
        assert_eq!(stored.state, SandboxState::TearingDown);

        // The backend recovers; the next pass finishes the job.
        backend.terminate_fails.store(false, Ordering::SeqCst);
        let report = reconciler.run().await.expect("reconcile");
        assert_eq!(report.terminated, 1);
        assert!(registry.live().await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_on_empty_registry() {
        let registry = Arc::new(SandboxRegistry::in_memory().await.expect("registry"));
        let backend = Arc::new(ReapOnlyBackend::new());

        let report = Reconciler::new(backend, registry)
            .run()
            .await
            .expect("reconcile");

        assert_eq!(report, ReconcileReport::default());
    }

    #[test]
    fn test_report_display() {
        let report = ReconcileReport {
            examined: 4,
            terminated: 2,
            untracked: 1,
            unreachable: 1,
            skipped: 0,
            swept: 3,
        };
        let rendered = report.to_string();
        assert!(rendered.contains("examined 4"));
        assert!(rendered.contains("2 terminated"));
        assert!(rendered.contains("3 leftover resources swept"));
    }
}
