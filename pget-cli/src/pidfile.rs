//! Process-wide PID lockfile
//!
//! One pget at a time: the lockfile holds an advisory exclusive lock for
//! the life of the process. If another instance holds it, we warn once
//! and block until it exits.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use tracing::warn;

/// Held for the process lifetime; releasing the file releases the lock
#[derive(Debug)]
pub struct PidLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl PidLock {
    /// Path of the lockfile
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Acquire the exclusive pget lock, blocking if another instance runs
pub fn acquire() -> std::io::Result<PidLock> {
    let path = lock_path();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    if flock(&file, libc::LOCK_EX | libc::LOCK_NB).is_err() {
        warn!(path = %path.display(), "another pget instance is running, waiting for it");
        flock(&file, libc::LOCK_EX)?;
    }

    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(PidLock { _file: file, path })
}

#[allow(unsafe_code)]
fn flock(file: &std::fs::File, operation: i32) -> std::io::Result<()> {
    // SAFETY: flock on a valid owned fd with no aliasing concerns.
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// `/run/pget.pid` when writable (Linux services), otherwise
/// `$HOME/.pget.pid`, otherwise the temp dir
fn lock_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let run = PathBuf::from("/run/pget.pid");
        if probe_writable(&run) {
            return run;
        }
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".pget.pid");
    }
    std::env::temp_dir().join("pget.pid")
}

#[cfg(target_os = "linux")]
fn probe_writable(path: &std::path::Path) -> bool {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .is_ok()
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_acquired_and_records_pid() {
        // Point HOME at a scratch dir so the test never touches /run.
        let dir = tempfile::tempdir().expect("tempdir");
        let original = std::env::var_os("HOME");
        // SAFETY: single-threaded test process section.
        unsafe { std::env::set_var("HOME", dir.path()) };

        let lock = acquire().expect("acquire");
        let recorded = std::fs::read_to_string(lock.path()).expect("read pid");
        assert_eq!(
            recorded.trim().parse::<u32>().expect("pid"),
            std::process::id()
        );

        drop(lock);
        match original {
            // SAFETY: restoring the environment after the test body.
            Some(home) => unsafe { std::env::set_var("HOME", home) },
            None => unsafe { std::env::remove_var("HOME") },
        }
    }
}
