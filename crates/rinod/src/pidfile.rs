//! Single-instance guard backed by a PID file.
//!
//! One daemon runs per link identity. The PID file lives in the service
//! directory and is named after the identity (`CI:9001.pid`). A file whose
//! PID is no longer alive is stale and gets replaced.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process;

use tracing::{debug, info, warn};

/// Errors from PID file handling. All are startup-fatal.
#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("rinod already running with PID {pid} (PID file {path})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("Failed to read PID file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("PID file {path} does not contain a PID: {contents:?}")]
    Corrupt { path: PathBuf, contents: String },

    #[error("Failed to write PID file {path}: {error}")]
    Write { path: PathBuf, error: String },
}

/// Returns the PID file path for a link identity.
pub fn pid_file_path(service_dir: &Path, identity: &str) -> PathBuf {
    service_dir.join(format!("{identity}.pid"))
}

/// Checks if a process with the given PID is running.
///
/// Sends signal 0, which performs the permission and existence checks
/// without delivering anything. `EPERM` means the process exists but
/// belongs to someone else.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 has no side effects
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

/// Reads the PID recorded at `path`.
///
/// Returns `Ok(None)` when the file does not exist.
pub fn read_pid(path: &Path) -> Result<Option<u32>, PidFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PidFileError::Read {
                path: path.to_path_buf(),
                error: e.to_string(),
            })
        }
    };

    let trimmed = contents.trim();
    if trimmed.is_empty() {
        // Left behind by a crash between create and write
        return Ok(None);
    }

    trimmed
        .parse()
        .map(Some)
        .map_err(|_| PidFileError::Corrupt {
            path: path.to_path_buf(),
            contents: trimmed.to_string(),
        })
}

/// Returns the PID of a live instance recorded at `path`.
///
/// A stale file (dead PID) is removed.
pub fn read_running_pid(path: &Path) -> Result<Option<u32>, PidFileError> {
    match read_pid(path)? {
        Some(pid) if is_process_running(pid) => Ok(Some(pid)),
        Some(pid) => {
            debug!(pid, path = %path.display(), "Removing stale PID file");
            let _ = fs::remove_file(path);
            Ok(None)
        }
        None => Ok(None),
    }
}

/// An acquired PID file. Removed on [`release`](Self::release) or drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl PidFile {
    /// Claims `path` for the current process.
    ///
    /// Fails with [`PidFileError::AlreadyRunning`] if another live process
    /// holds it. Stale files are overwritten.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();
        let pid = process::id();
        debug!(path = %path.display(), "Checking PID file");

        if let Some(existing) = read_pid(&path)? {
            if existing != pid && is_process_running(existing) {
                return Err(PidFileError::AlreadyRunning {
                    pid: existing,
                    path,
                });
            }
            info!(pid = existing, path = %path.display(), "Replacing stale PID file");
        }

        let write_err = |e: io::Error| PidFileError::Write {
            path: path.clone(),
            error: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(&path, pid.to_string()).map_err(write_err)?;
        debug!(pid, path = %path.display(), "Wrote PID file");

        Ok(Self {
            path,
            pid,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Removes the PID file if it still names this process.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Never delete a file another instance has since claimed
        match read_pid(&self.path) {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
                }
            }
            _ => debug!(path = %self.path.display(), "PID file no longer ours, leaving it"),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.remove();
    }
}
