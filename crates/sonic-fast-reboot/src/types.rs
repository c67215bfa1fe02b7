//! Core data model: reboot modes, the handshake record and exit codes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// STATE_DB key of the pre-shutdown handshake record.
pub const HANDSHAKE_KEY: &str = "WARM_RESTART_TABLE|syncd";

/// Handshake record field holding the restore counter.
pub const RESTORE_COUNT_FIELD: &str = "restore_count";

/// Handshake record field holding the state.
pub const STATE_FIELD: &str = "state";

/// Reboot flavour, selected once per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebootMode {
    /// Plain reboot, no state preservation.
    Cold,
    /// Data plane keeps forwarding on stale tables; control plane restarts cold.
    Fast,
    /// Forwarding state is snapshotted and reconciled after boot.
    Warm,
    /// Platform-specific warm reboot with an accelerated ASIC restart.
    FastFast,
}

impl RebootMode {
    /// All modes, in order of increasing state preservation.
    pub const ALL: [RebootMode; 4] = [
        RebootMode::Cold,
        RebootMode::Fast,
        RebootMode::Warm,
        RebootMode::FastFast,
    ];

    /// Returns the mode name as used on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            RebootMode::Cold => "cold",
            RebootMode::Fast => "fast",
            RebootMode::Warm => "warm",
            RebootMode::FastFast => "fastfast",
        }
    }

    /// Name of the user-facing command for this mode, recorded in the reboot cause.
    pub fn command_name(&self) -> &'static str {
        match self {
            RebootMode::Cold => "reboot",
            RebootMode::Fast => "fast-reboot",
            RebootMode::Warm => "warm-reboot",
            RebootMode::FastFast => "fastfast-boot",
        }
    }

    /// Warm and FastFast preserve forwarding state through the handshake and snapshot.
    pub fn is_warm(&self) -> bool {
        matches!(self, RebootMode::Warm | RebootMode::FastFast)
    }

    /// `SONIC_BOOT_TYPE` value passed to the next kernel.
    pub fn boot_type(&self) -> Option<&'static str> {
        match self {
            RebootMode::Cold => None,
            RebootMode::Fast => Some("fast-reboot"),
            RebootMode::Warm => Some("warm"),
            RebootMode::FastFast => Some("fastfast"),
        }
    }

    /// Infers the mode from the name the binary was invoked as.
    pub fn from_program_name(program: &str) -> RebootMode {
        let name = program.rsplit('/').next().unwrap_or(program);
        match name {
            "warm-reboot" => RebootMode::Warm,
            "fastfast-boot" => RebootMode::FastFast,
            _ => RebootMode::Fast,
        }
    }
}

impl fmt::Display for RebootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

impl FromStr for RebootMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cold" | "reboot" => Ok(RebootMode::Cold),
            "fast" | "fast-reboot" => Ok(RebootMode::Fast),
            "warm" | "warm-reboot" => Ok(RebootMode::Warm),
            "fastfast" | "fastfast-boot" => Ok(RebootMode::FastFast),
            other => Err(format!("unknown reboot mode '{}'", other)),
        }
    }
}

/// State of the pre-shutdown handshake.
///
/// Only `Idle -> Requesting -> {Succeeded, Failed}` is valid. Terminal states
/// left over from a previous boot go back to `Idle` before a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// No request outstanding.
    Idle,
    /// Orchestrator asked syncd to prepare for shutdown.
    Requesting,
    /// syncd finished its pre-shutdown sequence.
    Succeeded,
    /// syncd could not complete its pre-shutdown sequence.
    Failed,
}

impl HandshakeState {
    /// Returns the value stored in the record's `state` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "idle",
            HandshakeState::Requesting => "requesting",
            HandshakeState::Succeeded => "pre-shutdown-succeeded",
            HandshakeState::Failed => "pre-shutdown-failed",
        }
    }

    /// Parses a stored `state` value. A missing or empty value reads as `Idle`.
    pub fn parse(value: Option<&str>) -> Option<HandshakeState> {
        match value.map(str::trim) {
            None | Some("") | Some("idle") => Some(HandshakeState::Idle),
            Some("requesting") => Some(HandshakeState::Requesting),
            Some("pre-shutdown-succeeded") => Some(HandshakeState::Succeeded),
            Some("pre-shutdown-failed") => Some(HandshakeState::Failed),
            Some(_) => None,
        }
    }

    /// Returns true for states written by syncd to end the handshake.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Succeeded | HandshakeState::Failed)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: HandshakeState) -> bool {
        matches!(
            (self, next),
            (HandshakeState::Idle, HandshakeState::Requesting)
                | (HandshakeState::Requesting, HandshakeState::Succeeded)
                | (HandshakeState::Requesting, HandshakeState::Failed)
                | (HandshakeState::Succeeded, HandshakeState::Idle)
                | (HandshakeState::Failed, HandshakeState::Idle)
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable handshake record shared with syncd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRecord {
    /// Number of warm restores syncd has performed.
    pub restore_count: u32,
    /// Handshake state.
    pub state: HandshakeState,
}

impl HandshakeRecord {
    /// Builds a record from the stored hash. Unknown state values are `None`.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let state = HandshakeState::parse(fields.get(STATE_FIELD).map(String::as_str))?;
        Some(Self {
            restore_count: Self::restore_count_from(fields),
            state,
        })
    }

    /// Reads the restore counter; missing or malformed values are 0.
    pub fn restore_count_from(fields: &HashMap<String, String>) -> u32 {
        fields
            .get(RESTORE_COUNT_FIELD)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0)
    }

    /// Field/value pairs for writing the record back.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (
                RESTORE_COUNT_FIELD.to_string(),
                self.restore_count.to_string(),
            ),
            (STATE_FIELD.to_string(), self.state.as_str().to_string()),
        ]
    }

    /// Moves the record to `next` if the transition is legal.
    pub fn transition(&mut self, next: HandshakeState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

impl Default for HandshakeRecord {
    fn default() -> Self {
        Self {
            restore_count: 0,
            state: HandshakeState::Idle,
        }
    }
}

/// Process exit codes. Values are stable; automation branches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RebootExitCode {
    /// Kernel handoff invoked.
    Success = 0,
    /// Generic failure.
    Failure = 1,
    /// Mode not supported on this platform.
    NotSupported = 2,
    /// Not enough free space on the durable volume.
    FileSystemFull = 3,
    /// Next boot image missing.
    NextImageNotExists = 4,
    /// orchagent could not be frozen.
    OrchAgentShutdown = 10,
    /// syncd failed to shut down or complete pre-shutdown.
    SyncdShutdown = 11,
    /// Pre-reboot forwarding state dump failed.
    FastRebootDumpFailure = 12,
}

impl RebootExitCode {
    /// Numeric process exit status.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Short description for logs and `--help`.
    pub fn description(&self) -> &'static str {
        match self {
            RebootExitCode::Success => "success",
            RebootExitCode::Failure => "failure",
            RebootExitCode::NotSupported => "reboot mode not supported",
            RebootExitCode::FileSystemFull => "file system full",
            RebootExitCode::NextImageNotExists => "next boot image does not exist",
            RebootExitCode::OrchAgentShutdown => "orchagent freeze failed",
            RebootExitCode::SyncdShutdown => "syncd shutdown failed",
            RebootExitCode::FastRebootDumpFailure => "fast-reboot dump failed",
        }
    }
}

impl From<RebootExitCode> for std::process::ExitCode {
    fn from(code: RebootExitCode) -> Self {
        std::process::ExitCode::from(code.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_program_name() {
        assert_eq!(
            RebootMode::from_program_name("/usr/local/bin/warm-reboot"),
            RebootMode::Warm
        );
        assert_eq!(
            RebootMode::from_program_name("fastfast-boot"),
            RebootMode::FastFast
        );
        assert_eq!(RebootMode::from_program_name("fast-reboot"), RebootMode::Fast);
        assert_eq!(RebootMode::from_program_name("anything"), RebootMode::Fast);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("warm".parse::<RebootMode>().unwrap(), RebootMode::Warm);
        assert_eq!("fast-reboot".parse::<RebootMode>().unwrap(), RebootMode::Fast);
        assert!("lukewarm".parse::<RebootMode>().is_err());
        assert!(RebootMode::FastFast.is_warm());
        assert!(!RebootMode::Fast.is_warm());
        assert_eq!(RebootMode::Cold.boot_type(), None);
    }

    #[test]
    fn test_handshake_valid_transitions() {
        use HandshakeState::*;
        assert!(Idle.can_transition_to(Requesting));
        assert!(Requesting.can_transition_to(Succeeded));
        assert!(Requesting.can_transition_to(Failed));
        assert!(Succeeded.can_transition_to(Idle));
        assert!(Failed.can_transition_to(Idle));
    }

    #[test]
    fn test_handshake_invalid_transitions() {
        use HandshakeState::*;
        let all = [Idle, Requesting, Succeeded, Failed];
        let legal = [
            (Idle, Requesting),
            (Requesting, Succeeded),
            (Requesting, Failed),
            (Succeeded, Idle),
            (Failed, Idle),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_handshake_state_parse() {
        assert_eq!(HandshakeState::parse(None), Some(HandshakeState::Idle));
        assert_eq!(HandshakeState::parse(Some("")), Some(HandshakeState::Idle));
        assert_eq!(
            HandshakeState::parse(Some("pre-shutdown-succeeded")),
            Some(HandshakeState::Succeeded)
        );
        assert_eq!(HandshakeState::parse(Some("garbage")), None);
    }

    #[test]
    fn test_record_roundtrip_through_fields() {
        let record = HandshakeRecord {
            restore_count: 3,
            state: HandshakeState::Requesting,
        };
        let fields: HashMap<String, String> = record.to_fields().into_iter().collect();
        assert_eq!(HandshakeRecord::from_fields(&fields), Some(record));
    }

    #[test]
    fn test_record_from_fields_keeps_restore_count() {
        let fields: HashMap<String, String> = [
            (RESTORE_COUNT_FIELD.to_string(), " 4 ".to_string()),
            (STATE_FIELD.to_string(), "pre-shutdown-failed".to_string()),
        ]
        .into_iter()
        .collect();
        let record = HandshakeRecord::from_fields(&fields).unwrap();
        assert_eq!(record.restore_count, 4);
        assert!(record.state.is_terminal());
        assert!(!HandshakeState::Requesting.is_terminal());

        let mut garbled = fields.clone();
        garbled.insert(STATE_FIELD.to_string(), "bogus".to_string());
        assert_eq!(HandshakeRecord::from_fields(&garbled), None);
        assert_eq!(HandshakeRecord::restore_count_from(&garbled), 4);
        assert_eq!(HandshakeRecord::restore_count_from(&HashMap::new()), 0);
    }

    #[test]
    fn test_record_stale_terminal_must_pass_through_idle() {
        let mut record = HandshakeRecord {
            restore_count: 1,
            state: HandshakeState::Succeeded,
        };
        assert!(!record.transition(HandshakeState::Requesting));
        assert!(record.transition(HandshakeState::Idle));
        assert!(record.transition(HandshakeState::Requesting));
    }

    #[test]
    fn test_exit_code_values_are_stable() {
        assert_eq!(RebootExitCode::Success.code(), 0);
        assert_eq!(RebootExitCode::Failure.code(), 1);
        assert_eq!(RebootExitCode::NotSupported.code(), 2);
        assert_eq!(RebootExitCode::FileSystemFull.code(), 3);
        assert_eq!(RebootExitCode::NextImageNotExists.code(), 4);
        assert_eq!(RebootExitCode::OrchAgentShutdown.code(), 10);
        assert_eq!(RebootExitCode::SyncdShutdown.code(), 11);
        assert_eq!(RebootExitCode::FastRebootDumpFailure.code(), 12);
    }
}
