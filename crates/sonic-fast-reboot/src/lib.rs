//! Fast/warm reboot orchestration for SONiC switches.
//!
//! Reboots the control-plane kernel while forwarding either continues
//! (warm) or resumes shortly after the new kernel starts (fast). The core is
//! the reboot state machine: the pre-shutdown handshake with syncd, the
//! ordered service drain, the state snapshot and recovery of aborted
//! attempts.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod controller;
pub mod drain;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod lock;
pub mod platform;
pub mod reboot_cause;
pub mod recovery;
pub mod redis_store;
pub mod shell;
pub mod snapshot;
pub mod state_db;
pub mod system;
pub mod types;

pub use collaborators::{
    BootImage, BootImageResolver, Collaborators, ForwardingStateDumper, ForwardingSyncDaemon,
    HostProbe, KernelLoader, OrchAgent, ServiceRuntime,
};
pub use config::{DEFAULT_CONFIG_PATH, RebootConfig, load_config, parse_config};
pub use context::{RebootContext, RestartIntent};
pub use controller::{Preflight, RebootController, RebootOptions};
pub use drain::{
    Anomaly, DrainReport, DrainStep, FailurePolicy, ServiceDrainSequencer, StepAction,
    StepExecutor, StepKind, StopMethod, SuccessCriteria,
};
pub use error::*;
pub use executor::RebootStepExecutor;
pub use handshake::{HandshakeTimings, PreShutdownCoordinator};
pub use lock::RebootLock;
pub use platform::{AsicType, PlatformProfile, boot_cmdline};
pub use recovery::{FailureRecovery, RecoveryGuard, RecoveryReport};
pub use redis_store::RedisStateStore;
pub use snapshot::{NamespaceFilter, SnapshotHandle, SnapshotManifest, StateSnapshotStore};
pub use state_db::{MemoryStateStore, StateStore, StoreDump};
pub use types::*;
