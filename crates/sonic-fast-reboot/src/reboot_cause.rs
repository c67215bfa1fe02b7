//! Reboot cause record read by the next boot.

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::RebootMode;

/// Invoking user: `SUDO_USER`, then `USER`, then "unknown".
pub fn invoking_user() -> String {
    ["SUDO_USER", "USER"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|user| !user.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Formats the reboot cause line.
pub fn format_reboot_cause(mode: RebootMode, user: &str, time: DateTime<Utc>) -> String {
    format!(
        "User issued '{}' command [User: {}, Time: {}]",
        mode.command_name(),
        user,
        time.format("%a %d %b %Y %I:%M:%S %p UTC")
    )
}

/// Writes the reboot cause atomically (temp file + rename).
pub fn write_reboot_cause(path: &Path, mode: RebootMode, user: &str) -> io::Result<()> {
    let line = format_reboot_cause(mode, user, Utc::now());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, format!("{}\n", line))?;
    fs::rename(&tmp, path)?;
    tracing::info!(path = %path.display(), cause = %line, "Recorded reboot cause");
    Ok(())
}
