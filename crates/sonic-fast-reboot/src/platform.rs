//! Platform profiles.
//!
//! The ASIC type is resolved once at startup into a [`PlatformProfile`],
//! which answers which reboot modes are available and which ordered drain
//! plan each mode runs.

use std::fmt;

use crate::drain::{DrainStep, FailurePolicy, StepAction, StopMethod, SuccessCriteria};
use crate::types::RebootMode;

/// Routing control service.
pub const BGP_SERVICE: &str = "bgp";
/// Link aggregation service.
pub const TEAMD_SERVICE: &str = "teamd";
/// Orchestration agent service.
pub const SWSS_SERVICE: &str = "swss";
/// Forwarding-plane synchronization service.
pub const SYNCD_SERVICE: &str = "syncd";
/// Container runtime service.
pub const RUNTIME_SERVICE: &str = "docker";

/// Services stopped after the forwarding plane has been released.
const TRAILING_SERVICES: [&str; 2] = ["radv", "pmon"];

/// Kernel command line key carrying the boot type.
const BOOT_TYPE_KEY: &str = "SONIC_BOOT_TYPE=";

/// Switch ASIC family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsicType {
    Mellanox,
    Broadcom,
    /// Virtual switch.
    Vs,
    Other(String),
}

impl AsicType {
    /// Parses the `asic_type` value from the version file or config.
    pub fn parse(value: &str) -> AsicType {
        match value.trim().to_ascii_lowercase().as_str() {
            "mellanox" => AsicType::Mellanox,
            "broadcom" => AsicType::Broadcom,
            "vs" => AsicType::Vs,
            other => AsicType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AsicType::Mellanox => "mellanox",
            AsicType::Broadcom => "broadcom",
            AsicType::Vs => "vs",
            AsicType::Other(name) => name,
        }
    }
}

impl fmt::Display for AsicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode support and drain plans of one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    asic: AsicType,
    modes: Vec<RebootMode>,
    kill_syncd_on_fast: bool,
    dumps_forwarding_state: bool,
}

impl PlatformProfile {
    /// Resolves the profile for an ASIC type string.
    pub fn lookup(asic_type: &str) -> PlatformProfile {
        let asic = AsicType::parse(asic_type);
        let (modes, kill_syncd_on_fast, dumps_forwarding_state) = match asic {
            AsicType::Mellanox => (
                vec![
                    RebootMode::Cold,
                    RebootMode::Fast,
                    RebootMode::Warm,
                    RebootMode::FastFast,
                ],
                false,
                true,
            ),
            AsicType::Broadcom => (
                vec![RebootMode::Cold, RebootMode::Fast, RebootMode::Warm],
                true,
                true,
            ),
            AsicType::Vs => (
                vec![RebootMode::Cold, RebootMode::Fast, RebootMode::Warm],
                false,
                false,
            ),
            AsicType::Other(_) => (vec![RebootMode::Cold], false, false),
        };
        PlatformProfile {
            asic,
            modes,
            kill_syncd_on_fast,
            dumps_forwarding_state,
        }
    }

    pub fn asic(&self) -> &AsicType {
        &self.asic
    }

    /// Returns true if `mode` can run on this platform.
    pub fn supports(&self, mode: RebootMode) -> bool {
        self.modes.contains(&mode)
    }

    /// Ordered drain plan for `mode`.
    pub fn drain_plan(&self, mode: RebootMode) -> Vec<DrainStep> {
        match mode {
            RebootMode::Warm | RebootMode::FastFast => self.warm_plan(),
            RebootMode::Fast => self.fast_plan(),
            RebootMode::Cold => self.cold_plan(),
        }
    }

    /// bgp is quiesced before teamd so teamd's last LACPDU can still leave
    /// through a working data path.
    fn warm_plan(&self) -> Vec<DrainStep> {
        vec![
            DrainStep::new(
                "stop-bgp",
                StepAction::StopService {
                    service: BGP_SERVICE.to_string(),
                    method: StopMethod::Kill,
                },
            )
            .with_policy(FailurePolicy::IgnorableIfForced)
            .with_criteria(SuccessCriteria::ServicesInactive(vec![
                BGP_SERVICE.to_string(),
            ])),
            stop_teamd(),
            disable_advertisers(),
            DrainStep::new("freeze-orchagent", StepAction::FreezeOrchAgent),
            DrainStep::new("pre-shutdown-syncd", StepAction::PreShutdown),
            DrainStep::new("backup-state-database", StepAction::BackupStateDatabase),
            stop_remaining(&[SWSS_SERVICE, SYNCD_SERVICE], StopMethod::Kill),
            stop_runtime(),
        ]
    }

    fn fast_plan(&self) -> Vec<DrainStep> {
        let mut steps = Vec::new();
        if self.dumps_forwarding_state {
            steps.push(DrainStep::new(
                "dump-forwarding-state",
                StepAction::DumpForwardingState,
            ));
        }
        let syncd_method = if self.kill_syncd_on_fast {
            StopMethod::Kill
        } else {
            StopMethod::Stop
        };
        steps.extend([
            DrainStep::new(
                "stop-bgp",
                StepAction::StopService {
                    service: BGP_SERVICE.to_string(),
                    method: StopMethod::Stop,
                },
            )
            .with_policy(FailurePolicy::IgnorableIfForced),
            stop_teamd(),
            disable_advertisers(),
            DrainStep::new(
                "stop-syncd",
                StepAction::StopForwardingSync {
                    method: syncd_method,
                },
            ),
            stop_remaining(&[SWSS_SERVICE], StopMethod::Kill),
            stop_runtime(),
        ]);
        steps
    }

    fn cold_plan(&self) -> Vec<DrainStep> {
        vec![
            stop_remaining(&[SWSS_SERVICE, SYNCD_SERVICE], StopMethod::Stop),
            stop_runtime(),
        ]
    }
}

fn stop_teamd() -> DrainStep {
    DrainStep::new(
        "stop-teamd",
        StepAction::StopService {
            service: TEAMD_SERVICE.to_string(),
            method: StopMethod::Stop,
        },
    )
    .with_policy(FailurePolicy::IgnorableIfForced)
}

fn disable_advertisers() -> DrainStep {
    DrainStep::new("disable-advertisers", StepAction::DisableAdvertisers)
        .with_policy(FailurePolicy::Ignorable)
}

fn stop_remaining(leading: &[&str], method: StopMethod) -> DrainStep {
    let services = leading
        .iter()
        .chain(TRAILING_SERVICES.iter())
        .map(|s| s.to_string())
        .collect();
    DrainStep::new(
        "stop-remaining-services",
        StepAction::StopServices { services, method },
    )
    .with_policy(FailurePolicy::Ignorable)
}

fn stop_runtime() -> DrainStep {
    DrainStep::new(
        "stop-service-runtime",
        StepAction::StopServiceRuntime {
            service: RUNTIME_SERVICE.to_string(),
        },
    )
    .with_policy(FailurePolicy::Ignorable)
}

/// Command line for the next kernel: the running one with the boot type replaced.
pub fn boot_cmdline(current: &str, mode: RebootMode) -> String {
    let mut args: Vec<&str> = current
        .split_whitespace()
        .filter(|arg| !arg.starts_with(BOOT_TYPE_KEY))
        .collect();
    let boot_type = mode.boot_type().map(|t| format!("{}{}", BOOT_TYPE_KEY, t));
    if let Some(boot_type) = &boot_type {
        args.push(boot_type);
    }
    args.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::StepKind;

    fn names(steps: &[DrainStep]) -> Vec<&str> {
        steps.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_mode_support() {
        let mlnx = PlatformProfile::lookup("mellanox");
        assert!(RebootMode::ALL.iter().all(|m| mlnx.supports(*m)));

        let brcm = PlatformProfile::lookup("Broadcom");
        assert_eq!(brcm.asic(), &AsicType::Broadcom);
        assert!(brcm.supports(RebootMode::Warm));
        assert!(!brcm.supports(RebootMode::FastFast));

        let other = PlatformProfile::lookup("marvell");
        assert_eq!(other.asic().as_str(), "marvell");
        assert!(other.supports(RebootMode::Cold));
        assert!(!other.supports(RebootMode::Fast));
    }

    #[test]
    fn test_warm_plan_order() {
        let plan = PlatformProfile::lookup("mellanox").drain_plan(RebootMode::Warm);
        assert_eq!(
            names(&plan),
            vec![
                "stop-bgp",
                "stop-teamd",
                "disable-advertisers",
                "freeze-orchagent",
                "pre-shutdown-syncd",
                "backup-state-database",
                "stop-remaining-services",
                "stop-service-runtime",
            ]
        );
        let teamd = names(&plan).iter().position(|n| *n == "stop-teamd");
        let pre = names(&plan).iter().position(|n| *n == "pre-shutdown-syncd");
        assert!(teamd < pre);
        assert_eq!(plan[4].policy, FailurePolicy::Fatal);
        assert_eq!(plan[6].policy, FailurePolicy::Ignorable);
    }

    #[test]
    fn test_fastfast_runs_warm_plan() {
        let profile = PlatformProfile::lookup("mellanox");
        assert_eq!(
            profile.drain_plan(RebootMode::FastFast),
            profile.drain_plan(RebootMode::Warm)
        );
    }

    #[test]
    fn test_fast_plan_has_no_handshake() {
        for asic in ["mellanox", "broadcom", "vs"] {
            let plan = PlatformProfile::lookup(asic).drain_plan(RebootMode::Fast);
            assert!(plan.iter().all(|s| s.kind() != StepKind::PreShutdown));
            assert!(plan.iter().all(|s| s.kind() != StepKind::BackupStateDatabase));
        }
    }

    #[test]
    fn test_broadcom_kills_syncd_on_fast() {
        let plan = PlatformProfile::lookup("broadcom").drain_plan(RebootMode::Fast);
        let syncd = plan.iter().find(|s| s.name == "stop-syncd").unwrap();
        assert_eq!(
            syncd.action,
            StepAction::StopForwardingSync {
                method: StopMethod::Kill
            }
        );

        let plan = PlatformProfile::lookup("mellanox").drain_plan(RebootMode::Fast);
        let syncd = plan.iter().find(|s| s.name == "stop-syncd").unwrap();
        assert_eq!(
            syncd.action,
            StepAction::StopForwardingSync {
                method: StopMethod::Stop
            }
        );
    }

    #[test]
    fn test_vs_skips_forwarding_dump() {
        let plan = PlatformProfile::lookup("vs").drain_plan(RebootMode::Fast);
        assert_eq!(plan[0].name, "stop-bgp");
        let plan = PlatformProfile::lookup("broadcom").drain_plan(RebootMode::Fast);
        assert_eq!(plan[0].kind(), StepKind::DumpForwardingState);
    }

    #[test]
    fn test_boot_cmdline_replaces_boot_type() {
        let current = "BOOT_IMAGE=/image-1/boot/vmlinuz root=/dev/sda3 SONIC_BOOT_TYPE=warm quiet";
        assert_eq!(
            boot_cmdline(current, RebootMode::Fast),
            "BOOT_IMAGE=/image-1/boot/vmlinuz root=/dev/sda3 quiet SONIC_BOOT_TYPE=fast-reboot"
        );
        assert_eq!(
            boot_cmdline("root=/dev/sda3", RebootMode::FastFast),
            "root=/dev/sda3 SONIC_BOOT_TYPE=fastfast"
        );
        assert_eq!(
            boot_cmdline("root=/dev/sda3 SONIC_BOOT_TYPE=warm", RebootMode::Cold),
            "root=/dev/sda3"
        );
    }
}
