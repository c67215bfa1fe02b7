//! Ordered, fault-tolerant service drain.
//!
//! A drain plan is an ordered list of [`DrainStep`]s. The sequencer runs
//! them strictly one after another; what a step does is delegated to a
//! [`StepExecutor`], what happens when it fails is decided here from the
//! step's [`FailurePolicy`].

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::RebootContext;
use crate::error::{DrainError, StepError};
use crate::types::RebootExitCode;

/// What happens when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the drain.
    Fatal,
    /// Continue only when the reboot was forced.
    IgnorableIfForced,
    /// Record an anomaly and continue.
    Ignorable,
}

/// How a service is brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMethod {
    /// Graceful stop.
    Stop,
    /// Immediate kill.
    Kill,
}

/// Action performed by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Dump FDB/ARP/route state for the next boot.
    DumpForwardingState,
    /// Bring down one service.
    StopService {
        /// Service name.
        service: String,
        /// Stop or kill.
        method: StopMethod,
    },
    /// Bring down syncd without the pre-shutdown handshake.
    StopForwardingSync {
        /// Stop or kill.
        method: StopMethod,
    },
    /// Disable the configured external notification targets.
    DisableAdvertisers,
    /// Pause orchagent.
    FreezeOrchAgent,
    /// Run the pre-shutdown handshake with syncd.
    PreShutdown,
    /// Snapshot the forwarding state database.
    BackupStateDatabase,
    /// Bring down a batch of services; every one is attempted.
    StopServices {
        /// Service names.
        services: Vec<String>,
        /// Stop or kill.
        method: StopMethod,
    },
    /// Stop the container runtime itself.
    StopServiceRuntime {
        /// Runtime service name.
        service: String,
    },
}

impl StepAction {
    /// Kind of this action.
    pub fn kind(&self) -> StepKind {
        match self {
            StepAction::DumpForwardingState => StepKind::DumpForwardingState,
            StepAction::StopService { .. } => StepKind::StopService,
            StepAction::StopForwardingSync { .. } => StepKind::StopForwardingSync,
            StepAction::DisableAdvertisers => StepKind::DisableAdvertisers,
            StepAction::FreezeOrchAgent => StepKind::FreezeOrchAgent,
            StepAction::PreShutdown => StepKind::PreShutdown,
            StepAction::BackupStateDatabase => StepKind::BackupStateDatabase,
            StepAction::StopServices { .. } => StepKind::StopServices,
            StepAction::StopServiceRuntime { .. } => StepKind::StopServiceRuntime,
        }
    }
}

/// Fieldless discriminant of [`StepAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    DumpForwardingState,
    StopService,
    StopForwardingSync,
    DisableAdvertisers,
    FreezeOrchAgent,
    PreShutdown,
    BackupStateDatabase,
    StopServices,
    StopServiceRuntime,
}

impl StepKind {
    /// Exit code reported when a step of this kind fails fatally.
    pub fn failure_exit_code(&self) -> RebootExitCode {
        match self {
            StepKind::DumpForwardingState => RebootExitCode::FastRebootDumpFailure,
            StepKind::FreezeOrchAgent => RebootExitCode::OrchAgentShutdown,
            StepKind::PreShutdown | StepKind::StopForwardingSync => RebootExitCode::SyncdShutdown,
            _ => RebootExitCode::Failure,
        }
    }
}

/// Condition checked after a step's action returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuccessCriteria {
    /// The action returning `Ok` is enough.
    Completed,
    /// The named services must no longer be running.
    ServicesInactive(Vec<String>),
}

/// One ordered unit of the drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainStep {
    /// Name used in logs and errors.
    pub name: String,
    /// What the step does.
    pub action: StepAction,
    /// What must hold afterwards.
    pub criteria: SuccessCriteria,
    /// What a failure means.
    pub policy: FailurePolicy,
}

impl DrainStep {
    /// A fatal step whose success is its action completing.
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
            criteria: SuccessCriteria::Completed,
            policy: FailurePolicy::Fatal,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_criteria(mut self, criteria: SuccessCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Kind of the step's action.
    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}

impl fmt::Display for DrainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A tolerated step failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    /// Failed step.
    pub step: String,
    /// Kind of the failed step.
    pub kind: StepKind,
    /// Policy that allowed continuing.
    pub policy: FailurePolicy,
    /// Failure description.
    pub message: String,
}

/// Outcome of a drain that ran to the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Steps that succeeded, in order.
    pub completed: Vec<String>,
    /// Steps that failed but were tolerated, in order.
    pub anomalies: Vec<Anomaly>,
}

impl DrainReport {
    /// Returns true if every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}

/// Performs step actions against the system.
#[async_trait]
pub trait StepExecutor: Send {
    /// Performs the action of `step`.
    async fn execute(&mut self, step: &DrainStep, ctx: &mut RebootContext)
    -> Result<(), StepError>;

    /// Checks criteria other than [`SuccessCriteria::Completed`].
    async fn verify(&mut self, criteria: &SuccessCriteria) -> Result<(), StepError>;
}

/// Runs a drain plan in order, applying failure policies.
#[derive(Debug, Clone)]
pub struct ServiceDrainSequencer {
    force: bool,
    cancel: CancellationToken,
}

impl ServiceDrainSequencer {
    /// `force` lets `IgnorableIfForced` steps continue past failure.
    pub fn new(force: bool, cancel: CancellationToken) -> Self {
        Self { force, cancel }
    }

    /// Whether a failure under `policy` is tolerated.
    pub fn tolerates(&self, policy: FailurePolicy) -> bool {
        match policy {
            FailurePolicy::Fatal => false,
            FailurePolicy::IgnorableIfForced => self.force,
            FailurePolicy::Ignorable => true,
        }
    }

    /// Runs `steps` in order.
    ///
    /// Stops at the first failure that is not tolerated; later steps are
    /// never invoked. Tolerated failures are recorded once, both in `ctx`
    /// and in the returned report.
    pub async fn run<E>(
        &self,
        steps: &[DrainStep],
        executor: &mut E,
        ctx: &mut RebootContext,
    ) -> Result<DrainReport, DrainError>
    where
        E: StepExecutor + ?Sized,
    {
        let mut report = DrainReport::default();
        let total = steps.len();

        for (index, step) in steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(step = %step.name, "Drain aborted");
                return Err(DrainError::Aborted {
                    step: step.name.clone(),
                });
            }

            info!(step = %step.name, index = index + 1, total, "Running drain step");
            let outcome = match executor.execute(step, ctx).await {
                Ok(()) if step.criteria == SuccessCriteria::Completed => Ok(()),
                Ok(()) => executor.verify(&step.criteria).await,
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(()) => {
                    report.completed.push(step.name.clone());
                    continue;
                }
                Err(e) if e.is_cancelled() || self.cancel.is_cancelled() => {
                    warn!(step = %step.name, error = %e, "Drain step cancelled");
                    return Err(DrainError::Aborted {
                        step: step.name.clone(),
                    });
                }
                Err(e) => e,
            };

            if self.tolerates(step.policy) {
                warn!(step = %step.name, policy = ?step.policy, error = %err, "Drain step failed, continuing");
                let anomaly = Anomaly {
                    step: step.name.clone(),
                    kind: step.kind(),
                    policy: step.policy,
                    message: err.to_string(),
                };
                ctx.record_anomaly(anomaly.clone());
                report.anomalies.push(anomaly);
            } else {
                error!(step = %step.name, error = %err, "Drain step failed");
                return Err(DrainError::StepFailed {
                    step: step.name.clone(),
                    kind: step.kind(),
                    source: err,
                });
            }
        }

        info!(
            completed = report.completed.len(),
            anomalies = report.anomalies.len(),
            "Drain finished"
        );
        Ok(report)
    }
}
