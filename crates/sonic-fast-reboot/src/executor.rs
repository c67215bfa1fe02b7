//! Drain step actions against the real collaborators.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::Collaborators;
use crate::config::RebootConfig;
use crate::context::RebootContext;
use crate::drain::{DrainStep, StepAction, StepExecutor, StopMethod, SuccessCriteria};
use crate::error::{CommandError, StepError};
use crate::handshake::{HandshakeTimings, PreShutdownCoordinator};
use crate::platform::SYNCD_SERVICE;
use crate::snapshot::StateSnapshotStore;

/// Executes drain steps using the bundled collaborators.
pub struct RebootStepExecutor {
    collaborators: Collaborators,
    handshake: PreShutdownCoordinator,
    snapshots: StateSnapshotStore,
    allowed_namespaces: Vec<String>,
    notification_targets: Vec<String>,
    freeze_attempts: u32,
    freeze_backoff: Duration,
    dump_dir: PathBuf,
    cancel: CancellationToken,
}

impl RebootStepExecutor {
    pub fn new(
        collaborators: &Collaborators,
        config: &RebootConfig,
        notification_targets: Vec<String>,
        cancel: CancellationToken,
    ) -> Self {
        let handshake = PreShutdownCoordinator::new(
            collaborators.state_db.clone(),
            collaborators.syncd.clone(),
            HandshakeTimings::from(&config.handshake),
            cancel.clone(),
        );
        let snapshots = StateSnapshotStore::new(collaborators.asic_db.clone(), &config.snapshot);
        Self {
            collaborators: collaborators.clone(),
            handshake,
            snapshots,
            allowed_namespaces: config.snapshot.allowed_namespaces.clone(),
            notification_targets,
            freeze_attempts: config.freeze.attempts,
            freeze_backoff: config.freeze.backoff(),
            dump_dir: config.paths.dump_dir.clone(),
            cancel,
        }
    }

    async fn stop(&self, service: &str, method: StopMethod) -> Result<(), CommandError> {
        debug!(service, method = ?method, "Stopping service");
        match method {
            StopMethod::Stop => self.collaborators.runtime.stop(service).await,
            StopMethod::Kill => self.collaborators.runtime.kill(service).await,
        }
    }

    /// Attempts every service even when earlier ones fail.
    async fn stop_all(&self, services: &[String], method: StopMethod) -> Result<(), StepError> {
        let mut failed = Vec::new();
        for service in services {
            if let Err(e) = self.stop(service, method).await {
                warn!(service = %service, error = %e, "Failed to stop service");
                failed.push(service.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StepError::ServicesFailed { services: failed })
        }
    }

    async fn disable_advertisers(&self, ctx: &mut RebootContext) -> Result<(), StepError> {
        let mut failed = Vec::new();
        for target in &self.notification_targets {
            ctx.mark_target_disabled(target);
            if let Err(e) = self.collaborators.runtime.stop(target).await {
                warn!(target = %target, error = %e, "Failed to disable notification target");
                failed.push(target.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StepError::ServicesFailed { services: failed })
        }
    }

    /// Pauses orchagent, retrying with a fixed backoff.
    async fn freeze_orchagent(&self) -> Result<(), StepError> {
        let attempts = self.freeze_attempts;
        for attempt in 1..=attempts {
            match self.collaborators.orchagent.pause().await {
                Ok(true) => {
                    info!(attempt, "orchagent paused");
                    return Ok(());
                }
                Ok(false) => warn!(attempt, attempts, "orchagent not ready to pause"),
                Err(e) => warn!(attempt, attempts, error = %e, "orchagent pause failed"),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
                    _ = tokio::time::sleep(self.freeze_backoff) => {}
                }
            }
        }
        Err(StepError::FreezeFailed { attempts })
    }
}

#[async_trait]
impl StepExecutor for RebootStepExecutor {
    async fn execute(
        &mut self,
        step: &DrainStep,
        ctx: &mut RebootContext,
    ) -> Result<(), StepError> {
        match &step.action {
            StepAction::DumpForwardingState => {
                self.collaborators.dumper.dump(&self.dump_dir).await?;
            }
            StepAction::StopService { service, method } => {
                self.stop(service, *method).await?;
            }
            StepAction::StopForwardingSync { method } => {
                self.stop(SYNCD_SERVICE, *method).await?;
            }
            StepAction::DisableAdvertisers => self.disable_advertisers(ctx).await?,
            StepAction::FreezeOrchAgent => self.freeze_orchagent().await?,
            StepAction::PreShutdown => self.handshake.request_pre_shutdown().await?,
            StepAction::BackupStateDatabase => {
                self.snapshots
                    .snapshot(&self.allowed_namespaces, ctx)
                    .await?;
            }
            StepAction::StopServices { services, method } => {
                self.stop_all(services, *method).await?;
            }
            StepAction::StopServiceRuntime { service } => {
                self.collaborators.runtime.stop(service).await?;
            }
        }
        Ok(())
    }

    async fn verify(&mut self, criteria: &SuccessCriteria) -> Result<(), StepError> {
        match criteria {
            SuccessCriteria::Completed => Ok(()),
            SuccessCriteria::ServicesInactive(services) => {
                let mut running = Vec::new();
                for service in services {
                    if self.collaborators.runtime.is_running(service).await? {
                        running.push(service.as_str());
                    }
                }
                if running.is_empty() {
                    Ok(())
                } else {
                    Err(StepError::CriteriaNotMet(format!(
                        "still running: {}",
                        running.join(", ")
                    )))
                }
            }
        }
    }
}
