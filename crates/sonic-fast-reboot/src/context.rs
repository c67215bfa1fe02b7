//! Per-attempt orchestration context.
//!
//! Every mutation the reboot sequence makes to the system is recorded here
//! before it is attempted, so [`crate::recovery::FailureRecovery`] knows
//! exactly what to undo.

use std::path::PathBuf;

use crate::collaborators::BootImage;
use crate::drain::Anomaly;
use crate::snapshot::SnapshotHandle;
use crate::types::RebootMode;

/// Persistent "restart intent" flags read by daemons on the next boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartIntent {
    /// `WARM_RESTART_ENABLE_TABLE|system`
    Warm,
    /// `FAST_REBOOT|system`
    Fast,
}

impl RestartIntent {
    /// Intent flag for a mode, if the mode sets one.
    pub fn for_mode(mode: RebootMode) -> Option<RestartIntent> {
        match mode {
            RebootMode::Warm | RebootMode::FastFast => Some(RestartIntent::Warm),
            RebootMode::Fast => Some(RestartIntent::Fast),
            RebootMode::Cold => None,
        }
    }

    /// STATE_DB key holding the flag.
    pub fn key(&self) -> &'static str {
        match self {
            RestartIntent::Warm => "WARM_RESTART_ENABLE_TABLE|system",
            RestartIntent::Fast => "FAST_REBOOT|system",
        }
    }

    /// Field holding the flag.
    pub fn field(&self) -> &'static str {
        "enable"
    }
}

/// Mutable state of one reboot attempt.
#[derive(Debug)]
pub struct RebootContext {
    mode: RebootMode,
    image: Option<BootImage>,
    kexec_reserved: bool,
    intent: Option<RestartIntent>,
    disabled_targets: Vec<String>,
    snapshot_pending: Option<PathBuf>,
    snapshot: Option<SnapshotHandle>,
    anomalies: Vec<Anomaly>,
    handoff_invoked: bool,
}

impl RebootContext {
    /// Fresh context for `mode`.
    pub fn new(mode: RebootMode, image: Option<BootImage>) -> Self {
        Self {
            mode,
            image,
            kexec_reserved: false,
            intent: None,
            disabled_targets: Vec::new(),
            snapshot_pending: None,
            snapshot: None,
            anomalies: Vec::new(),
            handoff_invoked: false,
        }
    }

    /// Reboot mode of this attempt.
    pub fn mode(&self) -> RebootMode {
        self.mode
    }

    /// Next-boot image, when one was resolved.
    pub fn image(&self) -> Option<&BootImage> {
        self.image.as_ref()
    }

    /// Records that a kernel load is about to be attempted.
    pub fn mark_kexec_reserved(&mut self) {
        self.kexec_reserved = true;
    }

    /// Records that the kernel reservation was released.
    pub fn clear_kexec_reserved(&mut self) {
        self.kexec_reserved = false;
    }

    /// Whether a kernel may be loaded.
    pub fn kexec_reserved(&self) -> bool {
        self.kexec_reserved
    }

    /// Records that an intent flag is about to be set.
    pub fn mark_intent(&mut self, intent: RestartIntent) {
        self.intent = Some(intent);
    }

    /// Records that the intent flag was cleared.
    pub fn clear_intent(&mut self) {
        self.intent = None;
    }

    /// Intent flag that may be set.
    pub fn intent(&self) -> Option<RestartIntent> {
        self.intent
    }

    /// Records that a notification target is about to be disabled.
    pub fn mark_target_disabled(&mut self, target: &str) {
        if !self.disabled_targets.iter().any(|t| t == target) {
            self.disabled_targets.push(target.to_string());
        }
    }

    /// Records that a notification target was restored.
    pub fn clear_target_disabled(&mut self, target: &str) {
        self.disabled_targets.retain(|t| t != target);
    }

    /// Targets that may be disabled.
    pub fn disabled_targets(&self) -> &[String] {
        &self.disabled_targets
    }

    /// Records that a durable snapshot file is being written at `path`.
    pub fn mark_snapshot_pending(&mut self, path: PathBuf) {
        self.snapshot_pending = Some(path);
    }

    /// Durable snapshot file that may be partially written.
    pub fn snapshot_pending(&self) -> Option<&PathBuf> {
        self.snapshot_pending.as_ref()
    }

    /// Records a complete snapshot.
    pub fn complete_snapshot(&mut self, handle: SnapshotHandle) {
        self.snapshot_pending = None;
        self.snapshot = Some(handle);
    }

    /// Complete snapshot written by this attempt.
    pub fn snapshot(&self) -> Option<&SnapshotHandle> {
        self.snapshot.as_ref()
    }

    /// Forgets snapshot state once recovery has preserved the files.
    pub fn clear_snapshot(&mut self) {
        self.snapshot_pending = None;
        self.snapshot = None;
    }

    /// Records a tolerated drain step failure.
    pub fn record_anomaly(&mut self, anomaly: Anomaly) {
        self.anomalies.push(anomaly);
    }

    /// Tolerated failures so far.
    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// Records that the kernel handoff is being invoked.
    pub fn mark_handoff_invoked(&mut self) {
        self.handoff_invoked = true;
    }

    /// Whether the point of no return was reached.
    pub fn handoff_invoked(&self) -> bool {
        self.handoff_invoked
    }

    /// Returns true if nothing needs undoing.
    pub fn is_clean(&self) -> bool {
        !self.kexec_reserved
            && self.intent.is_none()
            && self.disabled_targets.is_empty()
            && self.snapshot_pending.is_none()
            && self.snapshot.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_for_mode() {
        assert_eq!(
            RestartIntent::for_mode(RebootMode::FastFast),
            Some(RestartIntent::Warm)
        );
        assert_eq!(
            RestartIntent::for_mode(RebootMode::Fast),
            Some(RestartIntent::Fast)
        );
        assert_eq!(RestartIntent::for_mode(RebootMode::Cold), None);
        assert_eq!(RestartIntent::Warm.key(), "WARM_RESTART_ENABLE_TABLE|system");
    }

    #[test]
    fn test_new_context_is_clean() {
        let ctx = RebootContext::new(RebootMode::Warm, None);
        assert!(ctx.is_clean());
        assert!(!ctx.handoff_invoked());
    }

    #[test]
    fn test_marks_and_clears() {
        let mut ctx = RebootContext::new(RebootMode::Warm, None);
        ctx.mark_intent(RestartIntent::Warm);
        ctx.mark_target_disabled("lldp");
        ctx.mark_target_disabled("lldp");
        assert_eq!(ctx.disabled_targets(), ["lldp".to_string()]);
        assert!(!ctx.is_clean());

        ctx.clear_intent();
        ctx.clear_target_disabled("lldp");
        assert!(ctx.is_clean());
    }
}
