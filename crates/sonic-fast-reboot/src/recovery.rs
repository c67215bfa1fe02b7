//! Undo of a failed reboot attempt.
//!
//! [`FailureRecovery`] reverses exactly what the [`RebootContext`] says was
//! (or may have been) done, clearing each mark only once its undo
//! succeeded. Running it again, or on a context where nothing happened, is a
//! no-op. [`RecoveryGuard`] ties it to the lifetime of the context so it
//! also runs when the attempt unwinds without returning an error.

use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::collaborators::{KernelLoader, ServiceRuntime};
use crate::context::RebootContext;
use crate::snapshot;
use crate::state_db::StateStore;

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// A reserved kernel was unloaded.
    pub kexec_released: bool,
    /// Intent flag key that was reset to `false`.
    pub intent_cleared: Option<&'static str>,
    /// Notification targets started again.
    pub targets_restored: Vec<String>,
    /// Where an incomplete or unused snapshot was moved.
    pub preserved_snapshot: Option<PathBuf>,
    /// Undo actions that failed; their marks remain set.
    pub errors: Vec<String>,
}

impl RecoveryReport {
    /// Returns true if every undo action succeeded.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Best-effort undo of reboot side effects.
pub struct FailureRecovery {
    runtime: Arc<dyn ServiceRuntime>,
    kernel: Arc<dyn KernelLoader>,
    state_db: Arc<dyn StateStore>,
}

impl FailureRecovery {
    pub fn new(
        runtime: Arc<dyn ServiceRuntime>,
        kernel: Arc<dyn KernelLoader>,
        state_db: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            runtime,
            kernel,
            state_db,
        }
    }

    /// Undoes every mutation recorded in `ctx`. Never fails; failures are
    /// logged and reported.
    pub async fn recover(&self, ctx: &mut RebootContext) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        if ctx.is_clean() {
            info!(mode = %ctx.mode(), "Nothing to recover");
            return report;
        }
        warn!(mode = %ctx.mode(), "Recovering from failed reboot attempt");

        if ctx.kexec_reserved() {
            match self.kernel.unload().await {
                Ok(()) => {
                    ctx.clear_kexec_reserved();
                    report.kexec_released = true;
                    info!("Released loaded kernel");
                }
                Err(e) => {
                    error!(error = %e, "Failed to unload kernel");
                    report.errors.push(format!("kexec unload: {}", e));
                }
            }
        }

        if let Some(intent) = ctx.intent() {
            let fields = [(intent.field().to_string(), "false".to_string())];
            match self.state_db.hset(intent.key(), &fields).await {
                Ok(()) => {
                    ctx.clear_intent();
                    report.intent_cleared = Some(intent.key());
                    info!(key = intent.key(), "Cleared restart intent");
                }
                Err(e) => {
                    error!(key = intent.key(), error = %e, "Failed to clear restart intent");
                    report.errors.push(format!("{}: {}", intent.key(), e));
                }
            }
        }

        for target in ctx.disabled_targets().to_vec() {
            match self.runtime.start(&target).await {
                Ok(()) => {
                    ctx.clear_target_disabled(&target);
                    info!(target = %target, "Restored notification target");
                    report.targets_restored.push(target);
                }
                Err(e) => {
                    error!(target = %target, error = %e, "Failed to restore notification target");
                    report.errors.push(format!("{}: {}", target, e));
                }
            }
        }

        self.preserve_snapshot(ctx, &mut report);

        if report.is_complete() {
            info!("Recovery complete");
        } else {
            warn!(failures = report.errors.len(), "Recovery incomplete");
        }
        report
    }

    /// Moves a partial snapshot, or a complete one nobody will boot from,
    /// out of the path the next boot restores from.
    fn preserve_snapshot(&self, ctx: &mut RebootContext, report: &mut RecoveryReport) {
        let (path, label) = if let Some(pending) = ctx.snapshot_pending() {
            (pending.clone(), snapshot::PARTIAL_LABEL)
        } else if let Some(handle) = ctx.snapshot() {
            (handle.path.clone(), snapshot::ABORTED_LABEL)
        } else {
            return;
        };

        if !path.exists() {
            ctx.clear_snapshot();
            return;
        }
        match snapshot::preserve(&path, Some(label)) {
            Ok(target) => {
                ctx.clear_snapshot();
                info!(from = %path.display(), to = %target.display(), "Preserved snapshot");
                report.preserved_snapshot = Some(target);
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to preserve snapshot");
                report.errors.push(e.to_string());
            }
        }
    }
}

/// Owns the context of an attempt and runs recovery unless disarmed.
pub struct RecoveryGuard {
    ctx: RebootContext,
    recovery: Option<Arc<FailureRecovery>>,
}

impl RecoveryGuard {
    /// Arms recovery over `ctx`.
    pub fn arm(recovery: Arc<FailureRecovery>, ctx: RebootContext) -> Self {
        Self {
            ctx,
            recovery: Some(recovery),
        }
    }

    pub fn context(&self) -> &RebootContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RebootContext {
        &mut self.ctx
    }

    /// Past the point of no return: hands back the context without recovering.
    pub fn disarm(mut self) -> RebootContext {
        self.recovery = None;
        self.take_context()
    }

    /// Runs recovery now and hands back the context.
    pub async fn fire(mut self) -> (RebootContext, RecoveryReport) {
        let recovery = self.recovery.take();
        let mut ctx = self.take_context();
        let report = match recovery {
            Some(recovery) => recovery.recover(&mut ctx).await,
            None => RecoveryReport::default(),
        };
        (ctx, report)
    }

    fn take_context(&mut self) -> RebootContext {
        let mode = self.ctx.mode();
        mem::replace(&mut self.ctx, RebootContext::new(mode, None))
    }
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        let Some(recovery) = self.recovery.take() else {
            return;
        };
        if self.ctx.is_clean() {
            return;
        }
        let mut ctx = self.take_context();
        warn!(mode = %ctx.mode(), "Reboot context dropped while armed");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    recovery.recover(&mut ctx).await;
                });
            }
            Err(_) => error!("No async runtime available, recovery skipped"),
        }
    }
}
