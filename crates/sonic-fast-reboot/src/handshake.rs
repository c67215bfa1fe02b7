//! Pre-shutdown handshake with syncd.
//!
//! The orchestrator writes `requesting` into the handshake record, pokes
//! syncd out of band, then waits for syncd to write a terminal state. The
//! record's state field is the only synchronization between the two.
//!
//! ## Timing
//!
//! Two budgets apply. Every poll cycle charges one poll interval (100 ms)
//! against the overall budget (60 s). A single poll that hangs past the
//! per-poll timeout (5 s) charges the full per-poll timeout and counts as a
//! consecutive poll failure; more than the allowed number of consecutive
//! failures (3) aborts even though overall budget remains.
//!
//! Waiting between polls is a timed receive on the store's change channel,
//! so a terminal write is seen immediately when the backend supports change
//! notifications and within one poll interval otherwise.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::ForwardingSyncDaemon;
use crate::config::HandshakeConfig;
use crate::error::{HandshakeError, StoreError};
use crate::state_db::StateStore;
use crate::types::{
    HANDSHAKE_KEY, HandshakeRecord, HandshakeState, STATE_FIELD,
};

/// Handshake timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimings {
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Timeout of one poll.
    pub poll_timeout: Duration,
    /// Overall wait budget.
    pub overall_budget: Duration,
    /// Consecutive failed polls tolerated.
    pub max_consecutive_poll_timeouts: u32,
}

impl Default for HandshakeTimings {
    fn default() -> Self {
        Self::from(&HandshakeConfig::default())
    }
}

impl From<&HandshakeConfig> for HandshakeTimings {
    fn from(config: &HandshakeConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
            overall_budget: config.overall_timeout(),
            max_consecutive_poll_timeouts: config.max_consecutive_poll_timeouts,
        }
    }
}

/// Drives the pre-shutdown handshake.
pub struct PreShutdownCoordinator {
    store: Arc<dyn StateStore>,
    daemon: Arc<dyn ForwardingSyncDaemon>,
    timings: HandshakeTimings,
    cancel: CancellationToken,
}

impl PreShutdownCoordinator {
    /// Creates a coordinator over the STATE_DB handshake record.
    pub fn new(
        store: Arc<dyn StateStore>,
        daemon: Arc<dyn ForwardingSyncDaemon>,
        timings: HandshakeTimings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            daemon,
            timings,
            cancel,
        }
    }

    /// Runs the handshake. Succeeds only if syncd reports exactly `Succeeded`.
    pub async fn request_pre_shutdown(&self) -> Result<(), HandshakeError> {
        let record = self.reset_record().await?;
        info!(
            restore_count = record.restore_count,
            "Requesting syncd pre-shutdown"
        );

        self.daemon
            .request_pre_shutdown()
            .await
            .map_err(HandshakeError::DaemonUnreachable)?;

        let budget = self.timings.overall_budget;
        match tokio::time::timeout(budget, self.wait_for_terminal_state()).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Timeout { consumed: budget }),
        }
    }

    /// Clears a stale state to `Idle`, then writes `Requesting`.
    async fn reset_record(&self) -> Result<HandshakeRecord, HandshakeError> {
        let fields = self.store.hgetall(HANDSHAKE_KEY).await?;
        let mut record = HandshakeRecord::from_fields(&fields).unwrap_or_else(|| {
            warn!(state = ?fields.get(STATE_FIELD), "Unrecognized handshake state, resetting");
            HandshakeRecord {
                restore_count: HandshakeRecord::restore_count_from(&fields),
                state: HandshakeState::Failed,
            }
        });
        if record.state != HandshakeState::Idle {
            debug!(state = %record.state, "Clearing stale handshake state");
            record.state = HandshakeState::Idle;
            self.store.hset(HANDSHAKE_KEY, &record.to_fields()).await?;
        }

        record.transition(HandshakeState::Requesting);
        self.store.hset(HANDSHAKE_KEY, &record.to_fields()).await?;
        Ok(record)
    }

    async fn wait_for_terminal_state(&self) -> Result<(), HandshakeError> {
        let timings = self.timings;
        let mut changes = self.store.watch();
        let mut consumed = Duration::ZERO;
        let mut consecutive_failures = 0u32;
        let mut last_error: Option<StoreError> = None;
        let mut polls = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(HandshakeError::Cancelled);
            }
            if consumed >= timings.overall_budget {
                warn!(polls, consumed_ms = consumed.as_millis() as u64, "Handshake budget exhausted");
                return Err(HandshakeError::Timeout { consumed });
            }

            polls += 1;
            let read = self.store.hget(HANDSHAKE_KEY, STATE_FIELD);
            match tokio::time::timeout(timings.poll_timeout, read).await {
                Err(_) => {
                    consecutive_failures += 1;
                    consumed += timings.poll_timeout;
                    warn!(
                        consecutive = consecutive_failures,
                        consumed_ms = consumed.as_millis() as u64,
                        "Handshake poll timed out"
                    );
                    if consecutive_failures > timings.max_consecutive_poll_timeouts {
                        return Err(HandshakeError::PollTimeoutsExhausted {
                            count: consecutive_failures,
                        });
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    consecutive_failures += 1;
                    warn!(error = %e, consecutive = consecutive_failures, "Handshake poll failed");
                    if consecutive_failures > timings.max_consecutive_poll_timeouts {
                        return Err(HandshakeError::Store(e));
                    }
                    last_error = Some(e);
                }
                Ok(Ok(value)) => {
                    consecutive_failures = 0;
                    last_error = None;
                    if let Some(terminal) = Self::classify(value.as_deref()) {
                        return if terminal == HandshakeState::Succeeded {
                            info!(polls, "syncd pre-shutdown succeeded");
                            Ok(())
                        } else {
                            Err(HandshakeError::Rejected(terminal))
                        };
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(HandshakeError::Cancelled),
                _ = next_change(&mut changes) => {}
                _ = tokio::time::sleep(timings.poll_interval) => {}
            }
            consumed += timings.poll_interval;

            if let Some(e) = &last_error {
                debug!(error = %e, "Retrying handshake poll after store error");
            }
        }
    }

    /// Returns the terminal state if `value` is a legal successor of `Requesting`.
    ///
    /// Out-of-order or unknown values are ignored so that only syncd's
    /// terminal write ends the wait.
    fn classify(value: Option<&str>) -> Option<HandshakeState> {
        let observed = match HandshakeState::parse(value) {
            Some(state) => state,
            None => {
                warn!(value = ?value, "Ignoring unrecognized handshake state");
                return None;
            }
        };
        if observed == HandshakeState::Requesting {
            return None;
        }
        if observed.is_terminal() && HandshakeState::Requesting.can_transition_to(observed) {
            Some(observed)
        } else {
            warn!(observed = %observed, "Ignoring out-of-order handshake write");
            None
        }
    }
}

/// Resolves when the store reports a write; never resolves without a channel.
async fn next_change(changes: &mut Option<watch::Receiver<u64>>) {
    match changes {
        Some(rx) => {
            if rx.changed().await.is_err() {
                *changes = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
