//! Shell-backed collaborator implementations for a SONiC host.

use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::collaborators::{
    BootImage, BootImageResolver, ForwardingStateDumper, ForwardingSyncDaemon, HostProbe,
    KernelLoader, OrchAgent, ServiceRuntime,
};
use crate::error::CommandError;
use crate::shell::{
    self, DOCKER_CMD, FAST_REBOOT_DUMP_CMD, KEXEC_CMD, ORCHAGENT_RESTART_CHECK_CMD, REBOOT_CMD,
    SONIC_INSTALLER_CMD, SYNCD_REQUEST_SHUTDOWN_CMD, SYSTEMCTL_CMD, shellquote,
};

/// Services managed through systemd units.
#[derive(Debug, Default, Clone)]
pub struct SystemdRuntime;

#[async_trait]
impl ServiceRuntime for SystemdRuntime {
    async fn start(&self, service: &str) -> Result<(), CommandError> {
        let cmd = format!("{} start {}", SYSTEMCTL_CMD, shellquote(service));
        shell::exec_or_throw(&cmd).await.map(|_| ())
    }

    async fn stop(&self, service: &str) -> Result<(), CommandError> {
        let cmd = format!("{} stop {}", SYSTEMCTL_CMD, shellquote(service));
        shell::exec_or_throw(&cmd).await.map(|_| ())
    }

    async fn kill(&self, service: &str) -> Result<(), CommandError> {
        let cmd = format!(
            "{} kill --signal=SIGKILL {}",
            SYSTEMCTL_CMD,
            shellquote(service)
        );
        shell::exec_or_throw(&cmd).await.map(|_| ())
    }

    async fn is_running(&self, service: &str) -> Result<bool, CommandError> {
        let cmd = format!("{} is-active {}", SYSTEMCTL_CMD, shellquote(service));
        let result = shell::exec(&cmd).await?;
        Ok(result.success() && result.stdout == "active")
    }
}

/// orchagent inside the swss container.
#[derive(Debug, Clone)]
pub struct SwssOrchAgent {
    /// Time orchagent is given to drain its queue per attempt, in ms.
    pub wait_ms: u64,
    /// Queue checks orchagent makes before reporting it is not drained.
    pub retries: u32,
}

impl Default for SwssOrchAgent {
    fn default() -> Self {
        Self {
            wait_ms: 2000,
            retries: 5,
        }
    }
}

impl SwssOrchAgent {
    fn restart_check_command(&self) -> String {
        format!(
            "{} exec swss {} -w {} -r {}",
            DOCKER_CMD, ORCHAGENT_RESTART_CHECK_CMD, self.wait_ms, self.retries
        )
    }
}

#[async_trait]
impl OrchAgent for SwssOrchAgent {
    async fn pause(&self) -> Result<bool, CommandError> {
        let result = shell::exec(&self.restart_check_command()).await?;
        Ok(result.success())
    }
}

/// syncd inside its container.
#[derive(Debug, Default, Clone)]
pub struct SyncdShutdownRequester;

#[async_trait]
impl ForwardingSyncDaemon for SyncdShutdownRequester {
    async fn request_pre_shutdown(&self) -> Result<(), CommandError> {
        let cmd = format!("{} exec syncd {} --pre", DOCKER_CMD, SYNCD_REQUEST_SHUTDOWN_CMD);
        shell::exec_or_throw(&cmd).await.map(|_| ())
    }
}

/// `fast-reboot-dump.py`.
#[derive(Debug, Default, Clone)]
pub struct FastRebootDumper;

#[async_trait]
impl ForwardingStateDumper for FastRebootDumper {
    async fn dump(&self, target_dir: &Path) -> Result<(), CommandError> {
        fs::create_dir_all(target_dir).map_err(|e| CommandError::Spawn {
            command: format!("mkdir -p {}", target_dir.display()),
            source: e,
        })?;
        let cmd = format!(
            "{} -t {}",
            FAST_REBOOT_DUMP_CMD,
            shellquote(&target_dir.to_string_lossy())
        );
        shell::exec_or_throw(&cmd).await.map(|_| ())
    }
}

/// `/sbin/kexec` and `/sbin/reboot`.
#[derive(Debug, Default, Clone)]
pub struct Kexec;

#[async_trait]
impl KernelLoader for Kexec {
    async fn load(&self, image: &BootImage, cmdline: &str) -> Result<(), CommandError> {
        let cmd = format!(
            "{} -l {} --initrd={} --append={}",
            KEXEC_CMD,
            shellquote(&image.kernel.to_string_lossy()),
            shellquote(&image.initrd.to_string_lossy()),
            shellquote(cmdline)
        );
        shell::exec_or_throw(&cmd).await.map(|_| ())
    }

    async fn unload(&self) -> Result<(), CommandError> {
        shell::exec_or_throw(&format!("{} -u", KEXEC_CMD))
            .await
            .map(|_| ())
    }

    async fn exec(&self) -> Result<(), CommandError> {
        shell::exec_or_throw(shell::SYNC_CMD).await?;
        shell::exec_or_throw(&format!("{} -e", KEXEC_CMD))
            .await
            .map(|_| ())
    }

    async fn power_cycle(&self) -> Result<(), CommandError> {
        shell::exec_or_throw(shell::SYNC_CMD).await?;
        shell::exec_or_throw(REBOOT_CMD).await.map(|_| ())
    }
}

/// Next image as reported by `sonic-installer list`.
#[derive(Debug, Clone)]
pub struct SonicInstallerImages {
    /// Volume images are installed under.
    pub image_volume: PathBuf,
}

impl SonicInstallerImages {
    /// Prefix `sonic-installer` puts in front of image versions.
    const IMAGE_PREFIX: &'static str = "SONiC-OS-";

    /// Creates a resolver for images under `image_volume`.
    pub fn new(image_volume: impl Into<PathBuf>) -> Self {
        Self {
            image_volume: image_volume.into(),
        }
    }

    /// Extracts the `Next:` image name from `sonic-installer list` output.
    pub fn parse_next_image(output: &str) -> Option<String> {
        output
            .lines()
            .find_map(|line| line.trim().strip_prefix("Next:"))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    }

    /// Locates kernel and initrd in `<volume>/image-<version>/boot`.
    pub fn locate(&self, name: &str) -> io::Result<Option<BootImage>> {
        let version = name.strip_prefix(Self::IMAGE_PREFIX).unwrap_or(name);
        let boot_dir = self.image_volume.join(format!("image-{}", version)).join("boot");
        if !boot_dir.is_dir() {
            return Ok(None);
        }

        let mut kernel = None;
        let mut initrd = None;
        for entry in fs::read_dir(&boot_dir)? {
            let path = entry?.path();
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if file_name.starts_with("vmlinuz-") {
                kernel = Some(path);
            } else if file_name.starts_with("initrd.img-") {
                initrd = Some(path);
            }
        }

        Ok(match (kernel, initrd) {
            (Some(kernel), Some(initrd)) => Some(BootImage {
                name: name.to_string(),
                kernel,
                initrd,
            }),
            _ => None,
        })
    }
}

#[async_trait]
impl BootImageResolver for SonicInstallerImages {
    async fn next_image(&self) -> Result<Option<BootImage>, CommandError> {
        let cmd = format!("{} list", SONIC_INSTALLER_CMD);
        let output = shell::exec_or_throw(&cmd).await?;
        let Some(name) = Self::parse_next_image(&output) else {
            return Ok(None);
        };
        self.locate(&name).map_err(|e| CommandError::Spawn {
            command: format!("locate image {}", name),
            source: e,
        })
    }
}

/// Probes of the local Linux host.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    /// File carrying the `asic_type:` line.
    pub version_file: PathBuf,
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self {
            version_file: PathBuf::from("/etc/sonic/sonic_version.yml"),
        }
    }
}

impl LinuxHost {
    /// Extracts `asic_type` from the SONiC version file contents.
    pub fn parse_asic_type(contents: &str) -> Option<String> {
        contents.lines().find_map(|line| {
            let value = line.trim().strip_prefix("asic_type:")?;
            let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
            (!value.is_empty()).then(|| value.to_string())
        })
    }
}

impl HostProbe for LinuxHost {
    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn available_space_mb(&self, path: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        let bytes = u64::from(stat.blocks_available()) * u64::from(stat.fragment_size());
        Ok(bytes / (1024 * 1024))
    }

    fn asic_type(&self) -> io::Result<String> {
        let contents = fs::read_to_string(&self.version_file)?;
        Self::parse_asic_type(&contents).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no asic_type in {}", self.version_file.display()),
            )
        })
    }

    fn kernel_cmdline(&self) -> io::Result<String> {
        Ok(fs::read_to_string("/proc/cmdline")?.trim().to_string())
    }
}
