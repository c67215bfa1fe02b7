//! Configuration file support.
//!
//! Loads reboot tunables from TOML. Default location:
//! `/etc/sonic/fast-reboot.toml`. Every field has a default, so a missing file
//! or a partial file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/fast-reboot.toml";

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis database number for STATE_DB
    #[serde(default = "default_state_db_number")]
    pub state_db_number: u32,

    /// Redis database number for ASIC_DB
    #[serde(default = "default_asic_db_number")]
    pub asic_db_number: u32,
}

/// Pre-shutdown handshake timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Delay between polls of the handshake record
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout for a single poll
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Overall wait budget
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,

    /// Consecutive poll timeouts tolerated before giving up
    #[serde(default = "default_max_poll_timeouts")]
    pub max_consecutive_poll_timeouts: u32,
}

/// orchagent freeze retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeConfig {
    /// Pause attempts
    #[serde(default = "default_freeze_attempts")]
    pub attempts: u32,

    /// Delay between attempts in seconds
    #[serde(default = "default_freeze_backoff_secs")]
    pub backoff_secs: u64,
}

/// State snapshot settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Key namespaces kept in the snapshot
    #[serde(default = "default_allowed_namespaces")]
    pub allowed_namespaces: Vec<String>,

    /// Durable directory the snapshot is moved into
    #[serde(default = "default_warmboot_dir")]
    pub directory: PathBuf,

    /// Snapshot file name inside `directory`
    #[serde(default = "default_snapshot_file")]
    pub file_name: String,

    /// Where the source store writes its dump before relocation
    #[serde(default = "default_dump_path")]
    pub dump_path: PathBuf,

    /// Rotated snapshots kept
    #[serde(default = "default_max_rotated")]
    pub max_rotated: usize,
}

/// Filesystem locations and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Reboot cause file read by the next boot
    #[serde(default = "default_reboot_cause_file")]
    pub reboot_cause_file: PathBuf,

    /// Mutual-exclusion lock file
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Volume holding images and warmboot state
    #[serde(default = "default_image_volume")]
    pub image_volume: PathBuf,

    /// Free space required on `image_volume`
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,

    /// Target directory of the fast-reboot forwarding dump
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,
}

/// Platform selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// ASIC type override; probed from the host when unset
    #[serde(default)]
    pub asic_type: Option<String>,
}

/// External notification targets disabled for the duration of the reboot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Services that would advertise the reboot to neighbours
    #[serde(default = "default_notification_targets")]
    pub targets: Vec<String>,
}

/// Complete fast-reboot configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebootConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Handshake timing
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// orchagent freeze retries
    #[serde(default)]
    pub freeze: FreezeConfig,

    /// Snapshot settings
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Paths and thresholds
    #[serde(default)]
    pub paths: PathsConfig,

    /// Platform selection
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Notification targets
    #[serde(default)]
    pub notification: NotificationConfig,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_state_db_number() -> u32 {
    6
}

fn default_asic_db_number() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_poll_timeout_secs() -> u64 {
    5
}

fn default_overall_timeout_secs() -> u64 {
    60
}

fn default_max_poll_timeouts() -> u32 {
    3
}

fn default_freeze_attempts() -> u32 {
    5
}

fn default_freeze_backoff_secs() -> u64 {
    2
}

fn default_allowed_namespaces() -> Vec<String> {
    ["ASIC_STATE", "VIDTORID", "RIDTOVID", "WARM_RESTART_TABLE"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_warmboot_dir() -> PathBuf {
    PathBuf::from("/host/warmboot")
}

fn default_snapshot_file() -> String {
    "asic_db.json".to_string()
}

fn default_dump_path() -> PathBuf {
    PathBuf::from("/var/lib/redis/asic_db.json")
}

fn default_max_rotated() -> usize {
    5
}

fn default_reboot_cause_file() -> PathBuf {
    PathBuf::from("/host/reboot-cause/reboot-cause.txt")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/run/fast-reboot.lock")
}

fn default_image_volume() -> PathBuf {
    PathBuf::from("/host")
}

fn default_min_free_space_mb() -> u64 {
    200
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("/host/fast-reboot")
}

fn default_notification_targets() -> Vec<String> {
    vec!["lldp".to_string()]
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            state_db_number: default_state_db_number(),
            asic_db_number: default_asic_db_number(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            overall_timeout_secs: default_overall_timeout_secs(),
            max_consecutive_poll_timeouts: default_max_poll_timeouts(),
        }
    }
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            attempts: default_freeze_attempts(),
            backoff_secs: default_freeze_backoff_secs(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            allowed_namespaces: default_allowed_namespaces(),
            directory: default_warmboot_dir(),
            file_name: default_snapshot_file(),
            dump_path: default_dump_path(),
            max_rotated: default_max_rotated(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            reboot_cause_file: default_reboot_cause_file(),
            lock_file: default_lock_file(),
            image_volume: default_image_volume(),
            min_free_space_mb: default_min_free_space_mb(),
            dump_dir: default_dump_dir(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            targets: default_notification_targets(),
        }
    }
}

impl HandshakeConfig {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-poll timeout as a duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// Overall budget as a duration.
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }
}

impl FreezeConfig {
    /// Backoff between attempts as a duration.
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl SnapshotConfig {
    /// Full path of the durable snapshot file.
    pub fn durable_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

impl RebootConfig {
    /// Checks value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "handshake.poll_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.handshake.poll_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "handshake.poll_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.handshake.overall_timeout_secs < self.handshake.poll_timeout_secs {
            return Err(ConfigError::invalid(
                "handshake.overall_timeout_secs",
                "must not be shorter than poll_timeout_secs",
            ));
        }
        if self.freeze.attempts == 0 {
            return Err(ConfigError::invalid("freeze.attempts", "must be at least 1"));
        }
        if self.snapshot.allowed_namespaces.is_empty() {
            return Err(ConfigError::invalid(
                "snapshot.allowed_namespaces",
                "must name at least one namespace",
            ));
        }
        if self
            .snapshot
            .allowed_namespaces
            .iter()
            .any(|ns| ns.trim().is_empty())
        {
            return Err(ConfigError::invalid(
                "snapshot.allowed_namespaces",
                "namespaces must not be empty",
            ));
        }
        if self.snapshot.file_name.is_empty() || self.snapshot.file_name.contains('/') {
            return Err(ConfigError::invalid(
                "snapshot.file_name",
                "must be a plain file name",
            ));
        }
        Ok(())
    }
}

/// Parses and validates a TOML string.
pub fn parse_config(contents: &str) -> Result<RebootConfig, ConfigError> {
    let config: RebootConfig =
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Loads the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<RebootConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "Config file not found, using defaults");
        return Ok(RebootConfig::default());
    }

    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = RebootConfig::default();
        assert_eq!(config.handshake.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.handshake.poll_timeout(), Duration::from_secs(5));
        assert_eq!(config.handshake.overall_timeout(), Duration::from_secs(60));
        assert_eq!(config.handshake.max_consecutive_poll_timeouts, 3);
        assert_eq!(config.freeze.attempts, 5);
        assert_eq!(config.freeze.backoff(), Duration::from_secs(2));
        assert_eq!(
            config.snapshot.durable_path(),
            PathBuf::from("/host/warmboot/asic_db.json")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
            [handshake]
            overall_timeout_secs = 90

            [notification]
            targets = ["lldp", "snmp"]
            "#,
        )
        .unwrap();
        assert_eq!(config.handshake.overall_timeout_secs, 90);
        assert_eq!(config.handshake.poll_interval_ms, 100);
        assert_eq!(config.notification.targets, vec!["lldp", "snmp"]);
        assert_eq!(config.database, DatabaseConfig::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = parse_config("[freeze]\nattempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("freeze.attempts"));

        let err = parse_config("[snapshot]\nallowed_namespaces = []\n").unwrap_err();
        assert!(err.to_string().contains("allowed_namespaces"));

        let err =
            parse_config("[handshake]\npoll_timeout_secs = 10\noverall_timeout_secs = 5\n")
                .unwrap_err();
        assert!(err.to_string().contains("overall_timeout_secs"));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            parse_config("[handshake\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = load_config(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RebootConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fast-reboot.toml");
        fs::write(&path, "[platform]\nasic_type = \"mellanox\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.platform.asic_type.as_deref(), Some("mellanox"));
    }
}
