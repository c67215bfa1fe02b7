//! Interfaces of the external collaborators the orchestrator drives.
//!
//! Each trait is the narrowest surface the reboot sequence consumes. The
//! shell-backed implementations live in [`crate::system`]; tests substitute
//! fakes or `mockall` mocks.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CommandError;
use crate::state_db::StateStore;

/// Container/service runtime, keyed by service name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Starts a service.
    async fn start(&self, service: &str) -> Result<(), CommandError>;

    /// Stops a service gracefully.
    async fn stop(&self, service: &str) -> Result<(), CommandError>;

    /// Kills a service without a graceful shutdown.
    async fn kill(&self, service: &str) -> Result<(), CommandError>;

    /// Returns true if the service is still running.
    async fn is_running(&self, service: &str) -> Result<bool, CommandError>;
}

/// Central orchestration agent (orchagent).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrchAgent: Send + Sync {
    /// Asks orchagent to pause processing. `Ok(false)` means it declined for now.
    async fn pause(&self) -> Result<bool, CommandError>;
}

/// Forwarding-plane synchronization daemon (syncd).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForwardingSyncDaemon: Send + Sync {
    /// Out-of-band notification to start the pre-shutdown sequence.
    async fn request_pre_shutdown(&self) -> Result<(), CommandError>;
}

/// Kernel re-exec and reboot primitives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KernelLoader: Send + Sync {
    /// Loads the next kernel for re-exec.
    async fn load(&self, image: &BootImage, cmdline: &str) -> Result<(), CommandError>;

    /// Releases a loaded kernel. Succeeds when nothing is loaded.
    async fn unload(&self) -> Result<(), CommandError>;

    /// Jumps into the loaded kernel.
    async fn exec(&self) -> Result<(), CommandError>;

    /// Full power-cycle reboot.
    async fn power_cycle(&self) -> Result<(), CommandError>;
}

/// Next-boot image lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BootImageResolver: Send + Sync {
    /// The image selected for the next boot, if any is installed.
    async fn next_image(&self) -> Result<Option<BootImage>, CommandError>;
}

/// Pre-reboot forwarding state dump used by fast reboot.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForwardingStateDumper: Send + Sync {
    /// Dumps FDB/ARP/default-route state into `target_dir`.
    async fn dump(&self, target_dir: &Path) -> Result<(), CommandError>;
}

/// Host facts checked before anything is mutated.
#[cfg_attr(test, mockall::automock)]
pub trait HostProbe: Send + Sync {
    /// Returns true when running with root privilege.
    fn is_privileged(&self) -> bool;

    /// Free space on the volume containing `path`, in MB.
    fn available_space_mb(&self, path: &Path) -> io::Result<u64>;

    /// ASIC type of this platform (e.g. "mellanox").
    fn asic_type(&self) -> io::Result<String>;

    /// Command line of the running kernel.
    fn kernel_cmdline(&self) -> io::Result<String>;
}

/// Kernel and initrd of an installed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootImage {
    /// Image name (e.g. "SONiC-OS-202405.1").
    pub name: String,
    /// Kernel image path.
    pub kernel: PathBuf,
    /// Initial ramdisk path.
    pub initrd: PathBuf,
}

impl BootImage {
    /// Returns true if both kernel and initrd are present on disk.
    pub fn files_exist(&self) -> bool {
        self.kernel.is_file() && self.initrd.is_file()
    }
}

/// Everything the controller drives, bundled for injection.
#[derive(Clone)]
pub struct Collaborators {
    /// Service runtime.
    pub runtime: Arc<dyn ServiceRuntime>,
    /// orchagent.
    pub orchagent: Arc<dyn OrchAgent>,
    /// syncd.
    pub syncd: Arc<dyn ForwardingSyncDaemon>,
    /// kexec / reboot.
    pub kernel: Arc<dyn KernelLoader>,
    /// Next-boot image lookup.
    pub images: Arc<dyn BootImageResolver>,
    /// Fast-reboot forwarding dump.
    pub dumper: Arc<dyn ForwardingStateDumper>,
    /// Host probes.
    pub host: Arc<dyn HostProbe>,
    /// STATE_DB: handshake record and restart intent flags.
    pub state_db: Arc<dyn StateStore>,
    /// ASIC_DB: snapshot source.
    pub asic_db: Arc<dyn StateStore>,
}
