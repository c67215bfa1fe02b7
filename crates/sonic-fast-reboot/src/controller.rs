//! Reboot orchestration entry point.
//!
//! [`RebootController::execute`] checks every precondition before touching
//! the system, then arms [`RecoveryGuard`] and drives the attempt: restart
//! intent, kernel load, drain, reboot cause, handoff. Any error, panic or
//! cancellation before the handoff runs recovery before returning.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collaborators::{BootImage, Collaborators};
use crate::config::RebootConfig;
use crate::context::{RebootContext, RestartIntent};
use crate::drain::{DrainReport, DrainStep, ServiceDrainSequencer};
use crate::error::{PreconditionError, RebootError, RebootResult};
use crate::executor::RebootStepExecutor;
use crate::lock::RebootLock;
use crate::platform::{PlatformProfile, boot_cmdline};
use crate::reboot_cause::{invoking_user, write_reboot_cause};
use crate::recovery::{FailureRecovery, RecoveryGuard};
use crate::types::{RebootExitCode, RebootMode};

/// Per-invocation flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebootOptions {
    /// Continue past `IgnorableIfForced` step failures.
    pub force: bool,
    /// Reboot through a full power cycle instead of kexec.
    pub power_cycle: bool,
    /// Check preconditions and report the plan without changing anything.
    pub dry_run: bool,
    /// Notification targets to disable; the configured list when `None`.
    pub notification_targets: Option<Vec<String>>,
}

/// Result of the precondition checks.
#[derive(Debug, Clone)]
pub struct Preflight {
    /// Resolved platform profile.
    pub profile: PlatformProfile,
    /// Next-boot image; `None` for cold reboots.
    pub image: Option<BootImage>,
    /// Drain plan that would run.
    pub plan: Vec<DrainStep>,
}

/// Runs one reboot attempt end to end.
pub struct RebootController {
    collaborators: Collaborators,
    config: RebootConfig,
    recovery: Arc<FailureRecovery>,
    cancel: CancellationToken,
}

impl RebootController {
    pub fn new(collaborators: Collaborators, config: RebootConfig, cancel: CancellationToken) -> Self {
        let recovery = Arc::new(FailureRecovery::new(
            collaborators.runtime.clone(),
            collaborators.kernel.clone(),
            collaborators.state_db.clone(),
        ));
        Self {
            collaborators,
            config,
            recovery,
            cancel,
        }
    }

    /// Runs a reboot in `mode` and maps the outcome to an exit code.
    pub async fn execute(&self, mode: RebootMode, options: &RebootOptions) -> RebootExitCode {
        match self.run(mode, options).await {
            Ok(()) => RebootExitCode::Success,
            Err(e) => {
                let code = e.exit_code();
                if e.is_precondition() {
                    error!(mode = %mode, error = %e, exit_code = code.code(), "{} refused, system untouched", mode);
                } else {
                    error!(mode = %mode, error = %e, exit_code = code.code(), "{} failed", mode);
                }
                code
            }
        }
    }

    /// Runs a reboot in `mode`.
    pub async fn run(&self, mode: RebootMode, options: &RebootOptions) -> RebootResult<()> {
        let preflight = self.preflight(mode).await?;
        if options.dry_run {
            info!(mode = %mode, platform = %preflight.profile.asic(), "Dry run: preconditions passed");
            for (index, step) in preflight.plan.iter().enumerate() {
                info!(index = index + 1, step = %step.name, policy = ?step.policy, "Planned drain step");
            }
            return Ok(());
        }

        let _lock = RebootLock::acquire(&self.config.paths.lock_file)?;

        let kexec = mode != RebootMode::Cold && !options.power_cycle;
        let mut guard = RecoveryGuard::arm(
            self.recovery.clone(),
            RebootContext::new(mode, preflight.image),
        );

        let outcome = {
            let drive =
                AssertUnwindSafe(self.drive(&preflight.plan, kexec, options, guard.context_mut()))
                    .catch_unwind();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(RebootError::Cancelled),
                result = drive => match result {
                    Ok(result) => result,
                    Err(panic) => Err(RebootError::Internal(panic_message(panic))),
                },
            }
        };

        match outcome {
            Ok(report) => {
                for anomaly in &report.anomalies {
                    warn!(step = %anomaly.step, error = %anomaly.message, "Tolerated drain failure");
                }
                guard.disarm();
                Ok(())
            }
            Err(RebootError::Cancelled) if guard.context().handoff_invoked() => {
                warn!("Cancelled after kernel handoff was invoked");
                guard.disarm();
                Err(RebootError::Cancelled)
            }
            Err(e) => {
                error!(error = %e, "Reboot attempt failed, running recovery");
                let (_, report) = guard.fire().await;
                if !report.is_complete() {
                    for failure in &report.errors {
                        error!(failure = %failure, "Recovery action failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Checks preconditions in order. Nothing is mutated.
    pub async fn preflight(&self, mode: RebootMode) -> RebootResult<Preflight> {
        let host = &self.collaborators.host;
        if !host.is_privileged() {
            return Err(PreconditionError::NotPrivileged.into());
        }

        let asic_type = match &self.config.platform.asic_type {
            Some(asic_type) => asic_type.clone(),
            None => host
                .asic_type()
                .map_err(|e| PreconditionError::Probe(format!("asic type: {}", e)))?,
        };
        let profile = PlatformProfile::lookup(&asic_type);
        if !profile.supports(mode) {
            return Err(PreconditionError::UnsupportedMode {
                mode,
                platform: asic_type,
            }
            .into());
        }

        let image = if mode == RebootMode::Cold {
            None
        } else {
            Some(self.next_image().await?)
        };

        if mode != RebootMode::Cold {
            let volume = &self.config.paths.image_volume;
            let available_mb = host
                .available_space_mb(volume)
                .map_err(|e| PreconditionError::Probe(format!("{}: {}", volume.display(), e)))?;
            let required_mb = self.config.paths.min_free_space_mb;
            if available_mb < required_mb {
                return Err(PreconditionError::InsufficientSpace {
                    path: volume.clone(),
                    available_mb,
                    required_mb,
                }
                .into());
            }
        }

        Ok(Preflight {
            plan: profile.drain_plan(mode),
            profile,
            image,
        })
    }

    async fn next_image(&self) -> RebootResult<BootImage> {
        let image = self
            .collaborators
            .images
            .next_image()
            .await
            .map_err(|e| PreconditionError::Probe(format!("next image: {}", e)))?
            .ok_or_else(|| PreconditionError::NextImageMissing("no next image selected".to_string()))?;
        if !image.files_exist() {
            return Err(PreconditionError::NextImageMissing(format!(
                "{}: kernel or initrd missing",
                image.name
            ))
            .into());
        }
        Ok(image)
    }

    async fn drive(
        &self,
        plan: &[DrainStep],
        kexec: bool,
        options: &RebootOptions,
        ctx: &mut RebootContext,
    ) -> RebootResult<DrainReport> {
        let mode = ctx.mode();
        let collaborators = &self.collaborators;

        if let Some(intent) = RestartIntent::for_mode(mode) {
            ctx.mark_intent(intent);
            let fields = [(intent.field().to_string(), "true".to_string())];
            collaborators.state_db.hset(intent.key(), &fields).await?;
            info!(key = intent.key(), "Set restart intent");
        }

        if kexec {
            let image = ctx
                .image()
                .cloned()
                .ok_or_else(|| RebootError::Internal("kexec without a next image".to_string()))?;
            let current = collaborators
                .host
                .kernel_cmdline()
                .map_err(|e| RebootError::io("/proc/cmdline", e))?;
            let cmdline = boot_cmdline(&current, mode);
            ctx.mark_kexec_reserved();
            collaborators
                .kernel
                .load(&image, &cmdline)
                .await
                .map_err(RebootError::Handoff)?;
            info!(image = %image.name, cmdline = %cmdline, "Loaded next kernel");
        }

        let targets = options
            .notification_targets
            .clone()
            .unwrap_or_else(|| self.config.notification.targets.clone());
        let mut executor =
            RebootStepExecutor::new(collaborators, &self.config, targets, self.cancel.clone());
        let sequencer = ServiceDrainSequencer::new(options.force, self.cancel.clone());
        let report = sequencer.run(plan, &mut executor, ctx).await?;

        if self.cancel.is_cancelled() {
            return Err(RebootError::Cancelled);
        }

        let cause_file = &self.config.paths.reboot_cause_file;
        write_reboot_cause(cause_file, mode, &invoking_user())
            .map_err(|e| RebootError::io(cause_file, e))?;

        ctx.mark_handoff_invoked();
        let handoff = if kexec {
            info!("Rebooting with kexec");
            collaborators.kernel.exec().await
        } else {
            info!("Rebooting with power cycle");
            collaborators.kernel.power_cycle().await
        };
        handoff.map_err(RebootError::Handoff)?;

        Ok(report)
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "panic: boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "panic: bang");
        assert_eq!(panic_message(Box::new(7u8)), "panic with non-string payload");
    }
}
