//! Single-instance guard for a state directory.
//!
//! The daemon holds an exclusive `flock` on `vigil.lock` for its lifetime and
//! records its pid in the file. The kernel drops the lock if the process
//! dies, so a stale file never blocks a restart.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use vigil_core::{Result, StatePaths, VigilError};

/// [`StateLock::is_held`] takes the lock for an instant, so a busy lock is
/// retried before it is reported as held.
const ACQUIRE_ATTEMPTS: u32 = 3;
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Take the lock or fail with [`VigilError::LockHeld`].
    pub fn acquire(paths: &StatePaths) -> Result<Self> {
        std::fs::create_dir_all(paths.root())?;
        let path = paths.lock_file();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut attempt = 1;
        while !try_lock(&file)? {
            if attempt < ACQUIRE_ATTEMPTS {
                debug!(path = %path.display(), attempt, "state lock busy, retrying");
                std::thread::sleep(ACQUIRE_RETRY_DELAY);
                attempt += 1;
                continue;
            }
            return Err(VigilError::LockHeld {
                path: paths.root().to_path_buf(),
                pid: read_pid(&path),
            });
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!(path = %path.display(), "state lock acquired");
        Ok(Self { file, path })
    }

    /// Whether some process currently holds the lock for `paths`. The check
    /// takes and releases the lock; [`StateLock::acquire`] retries past it.
    pub fn is_held(paths: &StatePaths) -> bool {
        let path = paths.lock_file();
        let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
            return false;
        };
        match try_lock(&file) {
            Ok(true) => {
                unlock(&file);
                false
            }
            Ok(false) => true,
            Err(_) => false,
        }
    }

    /// Pid recorded by the holder, if readable.
    pub fn holder_pid(paths: &StatePaths) -> Option<u32> {
        read_pid(&paths.lock_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        unlock(&self.file);
        debug!(path = %self.path.display(), "state lock released");
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let mut raw = String::new();
    File::open(path).ok()?.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}

#[cfg(unix)]
fn try_lock(file: &File) -> Result<bool> {
    use std::os::fd::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err.into())
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::fd::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

// No advisory locking off unix; a second daemon is not detected there.
#[cfg(not(unix))]
fn try_lock(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
