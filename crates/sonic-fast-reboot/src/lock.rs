//! Single-instance lock file.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{PreconditionError, RebootError};

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct RebootLock {
    path: PathBuf,
}

impl RebootLock {
    /// Creates the lock file holding our pid.
    ///
    /// A lock left by a process that no longer exists is reclaimed.
    pub fn acquire(path: &Path) -> Result<RebootLock, RebootError> {
        match Self::create(path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(RebootError::io(path, e)),
        }

        let holder = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        match holder {
            Some(pid) if process_alive(pid) => {
                Err(PreconditionError::AlreadyRunning {
                    path: path.to_path_buf(),
                    pid,
                }
                .into())
            }
            _ => {
                warn!(path = %path.display(), pid = ?holder, "Reclaiming stale lock");
                fs::remove_file(path).map_err(|e| RebootError::io(path, e))?;
                Self::create(path).map_err(|e| RebootError::io(path, e))
            }
        }
    }

    fn create(path: &Path) -> io::Result<RebootLock> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "Acquired reboot lock");
        Ok(RebootLock {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RebootLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove reboot lock");
        }
    }
}

fn process_alive(pid: i32) -> bool {
    pid > 0 && Path::new("/proc").join(pid.to_string()).exists()
}
