//! Shell command execution for the collaborator adapters.
//!
//! All external primitives (service runtime, kexec, syncd and orchagent
//! requests) go through [`exec`] so that quoting, logging and timeouts are
//! handled in one place.
//!
//! # Example
//!
//! ```ignore
//! use sonic_fast_reboot::shell::{self, SYSTEMCTL_CMD, shellquote};
//!
//! let cmd = format!("{} stop {}", SYSTEMCTL_CMD, shellquote("bgp"));
//! shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::CommandError;

/// Path to `systemctl` for service start/stop.
pub const SYSTEMCTL_CMD: &str = "/bin/systemctl";

/// Path to the `docker` CLI for in-container commands.
pub const DOCKER_CMD: &str = "/usr/bin/docker";

/// Path to `kexec` for loading and executing the next kernel.
pub const KEXEC_CMD: &str = "/sbin/kexec";

/// Path to `reboot` for a full power-cycle.
pub const REBOOT_CMD: &str = "/sbin/reboot";

/// Path to `sonic-installer` for image bookkeeping.
pub const SONIC_INSTALLER_CMD: &str = "/usr/local/bin/sonic-installer";

/// Pre-shutdown request tool inside the syncd container.
pub const SYNCD_REQUEST_SHUTDOWN_CMD: &str = "/usr/bin/syncd_request_shutdown";

/// orchagent freeze check tool inside the swss container.
pub const ORCHAGENT_RESTART_CHECK_CMD: &str = "/usr/bin/orchagent_restart_check";

/// Forwarding-state dump script used by fast reboot.
pub const FAST_REBOOT_DUMP_CMD: &str = "/usr/local/bin/fast-reboot-dump.py";

/// Path to `sync` for flushing filesystem buffers before handoff.
pub const SYNC_CMD: &str = "/bin/sync";

/// Default timeout applied by [`exec`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Characters that need escaping inside shell double-quotes: $, `, ", \ and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// ```
/// use sonic_fast_reboot::shell::shellquote;
///
/// assert_eq!(shellquote("bgp"), "\"bgp\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a command through `/bin/sh -c` with [`DEFAULT_TIMEOUT`].
pub async fn exec(cmd: &str) -> Result<ExecResult, CommandError> {
    exec_with_timeout(cmd, DEFAULT_TIMEOUT).await
}

/// Executes a command through `/bin/sh -c`, killing it after `timeout`.
pub async fn exec_with_timeout(cmd: &str, timeout: Duration) -> Result<ExecResult, CommandError> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| CommandError::TimedOut {
            command: cmd.to_string(),
            timeout,
        })?
        .map_err(|e| CommandError::Spawn {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a command and converts a non-zero exit into an error.
pub async fn exec_or_throw(cmd: &str) -> Result<String, CommandError> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(CommandError::Failed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_simple() {
        assert_eq!(shellquote("swss"), "\"swss\"");
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(shellquote("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert!(!result.success());
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_exec_or_throw_failure() {
        match exec_or_throw("exit 3").await {
            Err(CommandError::Failed { exit_code, .. }) => assert_eq!(exit_code, 3),
            other => panic!("Expected Failed error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let result = exec_with_timeout("sleep 5", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CommandError::TimedOut { .. })));
    }
}
