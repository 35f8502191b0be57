//! Single-instance guard.
//!
//! Two schedulers on one database would both adopt the same workers and
//! fight over hosts. The daemon takes an exclusive `flock` on a lock file
//! before touching anything and holds it for its lifetime.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, SchedulerError};


/// Holds the lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(path = %self.path.display(), "released scheduler lock");
    }
}


/// Take the lock without waiting. A held lock is
/// [`SchedulerError::AlreadyRunning`]; the holder's pid is in the file.
pub fn acquire_lock(lock_path: &Path) -> Result<LockGuard> {
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // No truncate here: the current holder's pid must survive a failed
    // attempt.
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(lock_path)?;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(SchedulerError::AlreadyRunning(lock_path.to_path_buf()));
        }
        return Err(err.into());
    }

    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    info!(path = %lock_path.display(), "acquired scheduler lock");
    Ok(LockGuard {
        file,
        path: lock_path.to_path_buf(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_holder_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sched.lock");
        let guard = acquire_lock(&path).unwrap();
        let err = acquire_lock(&path).unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning(ref p) if p == &path));
        drop(guard);
        assert!(acquire_lock(&path).is_ok());
    }

    #[test]
    fn lock_file_records_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sched.lock");
        let guard = acquire_lock(&path).unwrap();
        let content = std::fs::read_to_string(guard.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn refused_attempt_keeps_holder_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sched.lock");
        let _guard = acquire_lock(&path).unwrap();
        let _ = acquire_lock(&path);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
