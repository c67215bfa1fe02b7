//! Error types for reboot orchestration.
//!
//! Each component owns a narrow error enum; [`RebootError`] aggregates them at
//! the controller boundary and maps every failure onto a stable
//! [`RebootExitCode`] that external automation branches on.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::drain::StepKind;
use crate::types::{HandshakeState, RebootExitCode, RebootMode};

/// Result type alias for controller-level operations.
pub type RebootResult<T> = Result<T, RebootError>;

/// Failure of an external command or collaborator primitive.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Failed to spawn the command.
    #[error("Failed to execute shell command '{command}': {source}")]
    Spawn {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Command returned a non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    Failed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Command did not finish in time.
    #[error("Shell command timed out after {}s: '{command}'", .timeout.as_secs())]
    TimedOut {
        /// The command that hung.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Command output could not be interpreted.
    #[error("Unexpected output from '{command}': {message}")]
    UnexpectedOutput {
        /// The command whose output was rejected.
        command: String,
        /// What was wrong with it.
        message: String,
    },
}

impl CommandError {
    /// Creates an unexpected-output error.
    pub fn unexpected_output(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnexpectedOutput {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by a key-value state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Not connected or connection lost.
    #[error("{db}: connection error: {message}")]
    Connection {
        /// Database name (e.g. STATE_DB).
        db: String,
        /// Error message.
        message: String,
    },

    /// A store command failed.
    #[error("{db}: {operation} failed: {message}")]
    Command {
        /// Database name.
        db: String,
        /// The operation that failed (e.g. "hset", "keys").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Dump file could not be written or read.
    #[error("{db}: dump file {path}: {source}")]
    Dump {
        /// Database name.
        db: String,
        /// Dump file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Keys whose value type the hash-only dump format cannot carry.
    #[error("{db}: cannot dump non-hash key(s): {}", .keys.join(", "))]
    UnsupportedType {
        /// Database name.
        db: String,
        /// Offending keys, each as `<key> (<type>)`.
        keys: Vec<String>,
    },

    /// Dump contents could not be (de)serialized.
    #[error("{db}: dump serialization failed: {message}")]
    Serialization {
        /// Database name.
        db: String,
        /// Error message.
        message: String,
    },
}

impl StoreError {
    /// Creates a command error.
    pub fn command(
        db: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Command {
            db: db.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a connection error.
    pub fn connection(db: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            db: db.into(),
            message: message.into(),
        }
    }
}

/// Preconditions checked before anything is mutated.
#[derive(Debug, Error)]
pub enum PreconditionError {
    /// Not running with elevated privilege.
    #[error("This command must be run as root")]
    NotPrivileged,

    /// Reboot mode is not available on this platform.
    #[error("{mode} is not supported on platform '{platform}'")]
    UnsupportedMode {
        /// Requested mode.
        mode: RebootMode,
        /// Platform identifier.
        platform: String,
    },

    /// Not enough free space on the durable volume.
    #[error("Insufficient space on {}: {available_mb} MB available, {required_mb} MB required", .path.display())]
    InsufficientSpace {
        /// Volume that was checked.
        path: PathBuf,
        /// Free space found.
        available_mb: u64,
        /// Free space required.
        required_mb: u64,
    },

    /// No next-boot image is installed, or its files are missing.
    #[error("Next boot image not found: {0}")]
    NextImageMissing(String),

    /// Another reboot orchestration holds the lock.
    #[error("Another reboot is in progress (lock {} held by pid {pid})", .path.display())]
    AlreadyRunning {
        /// Lock file path.
        path: PathBuf,
        /// Pid recorded in the lock file.
        pid: i32,
    },

    /// A probe of the host failed.
    #[error("Precondition probe failed: {0}")]
    Probe(String),
}

/// Pre-shutdown handshake failures. All are fatal.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The forwarding-sync daemon could not be notified.
    #[error("Failed to request pre-shutdown from syncd: {0}")]
    DaemonUnreachable(#[source] CommandError),

    /// The handshake record could not be read or written.
    #[error("Handshake record access failed: {0}")]
    Store(#[from] StoreError),

    /// The daemon reported a terminal state other than success.
    #[error("syncd pre-shutdown ended in state '{0}'")]
    Rejected(HandshakeState),

    /// The overall wait budget was exhausted.
    #[error("syncd pre-shutdown did not complete within {}ms", .consumed.as_millis())]
    Timeout {
        /// Budget consumed when giving up.
        consumed: Duration,
    },

    /// Too many consecutive poll attempts hung.
    #[error("Handshake poll timed out {count} consecutive times")]
    PollTimeoutsExhausted {
        /// Consecutive poll timeouts observed.
        count: u32,
    },

    /// The wait was aborted by a signal.
    #[error("Handshake cancelled")]
    Cancelled,
}

/// Snapshot failures. A failed snapshot is never left looking complete.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The source store failed.
    #[error("Snapshot source store error: {0}")]
    Store(#[from] StoreError),

    /// Durable file handling failed.
    #[error("Snapshot I/O error on {}: {source}", .path.display())]
    Io {
        /// File being handled.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Excluded keys kept reappearing in the persisted dump.
    #[error("Snapshot still contains {} excluded key(s) after {attempts} attempts", .keys.len())]
    Contaminated {
        /// Filter/persist attempts made.
        attempts: u32,
        /// Offending keys from the final attempt.
        keys: Vec<String>,
    },

    /// Manifest or dump could not be (de)serialized.
    #[error("Snapshot serialization failed: {0}")]
    Serialization(String),
}

impl SnapshotError {
    /// Wraps an IO error with the file it concerns.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of a single drain step action or its success check.
#[derive(Debug, Error)]
pub enum StepError {
    /// A collaborator command failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The pre-shutdown handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The state snapshot failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Orchestration agent could not be paused.
    #[error("orchagent could not be paused after {attempts} attempt(s)")]
    FreezeFailed {
        /// Pause attempts made.
        attempts: u32,
    },

    /// One or more services in a batch failed to stop.
    #[error("Failed to stop service(s): {}", .services.join(", "))]
    ServicesFailed {
        /// Services that did not stop.
        services: Vec<String>,
    },

    /// The action ran but its success criteria did not hold.
    #[error("Success criteria not met: {0}")]
    CriteriaNotMet(String),

    /// The step was interrupted by an abort signal.
    #[error("Step cancelled")]
    Cancelled,
}

impl StepError {
    /// Returns true if the step stopped because of an abort signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            StepError::Cancelled | StepError::Handshake(HandshakeError::Cancelled)
        )
    }
}

/// Fatal outcome of the drain sequence.
#[derive(Debug, Error)]
pub enum DrainError {
    /// A step failed under a policy that does not allow continuing.
    #[error("Drain step '{step}' failed: {source}")]
    StepFailed {
        /// Step name.
        step: String,
        /// Kind of step, used for exit code selection.
        kind: StepKind,
        /// The step failure.
        #[source]
        source: StepError,
    },

    /// The sequence was aborted before or during the named step.
    #[error("Drain aborted at step '{step}'")]
    Aborted {
        /// The step that was interrupted or not started.
        step: String,
    },
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        /// Config path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Config file is not valid TOML for the schema.
    #[error("Failed to parse config file: {0}")]
    Parse(String),

    /// A value failed validation.
    #[error("Invalid configuration for {field}: {message}")]
    Invalid {
        /// Field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid configuration error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Top-level reboot failure.
#[derive(Debug, Error)]
pub enum RebootError {
    /// A precondition failed; nothing was mutated.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// The drain sequence failed.
    #[error(transparent)]
    Drain(#[from] DrainError),

    /// A state store operation outside the drain failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Loading the next kernel or handing off to it failed.
    #[error("Kernel handoff failed: {0}")]
    Handoff(#[source] CommandError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Local file handling failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// File being handled.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Aborted by a termination signal.
    #[error("Reboot aborted by signal")]
    Cancelled,

    /// Unexpected internal failure (e.g. a panic in the sequence).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RebootError {
    /// Wraps an IO error with the file it concerns.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Maps this failure onto its documented exit code.
    pub fn exit_code(&self) -> RebootExitCode {
        match self {
            RebootError::Precondition(e) => match e {
                PreconditionError::UnsupportedMode { .. } => RebootExitCode::NotSupported,
                PreconditionError::InsufficientSpace { .. } => RebootExitCode::FileSystemFull,
                PreconditionError::NextImageMissing(_) => RebootExitCode::NextImageNotExists,
                _ => RebootExitCode::Failure,
            },
            RebootError::Drain(DrainError::StepFailed { kind, .. }) => kind.failure_exit_code(),
            _ => RebootExitCode::Failure,
        }
    }

    /// Returns true if no mutation can have happened before this error.
    pub fn is_precondition(&self) -> bool {
        matches!(self, RebootError::Precondition(_))
    }
}
