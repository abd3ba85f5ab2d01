//! Pre-flight lock check
//!
//! Browsers keep some bookmark stores open with an exclusive lock while they
//! run. Before a pull the source file is probed; if another process holds a
//! write lock the cycle is skipped. Unlocking is left to the user.

use std::fmt;
use std::io;
use std::path::Path;

/// Probe for an exclusive lock held by another process
pub trait LockCheck: Send + Sync + fmt::Debug {
    fn is_locked(&self, path: &Path) -> io::Result<bool>;
}

/// POSIX advisory lock probe using `fcntl(F_GETLK)`
///
/// Asks whether a read lock over the whole file could be placed. Only a write
/// lock held elsewhere blocks that, which is what "exclusively locked" means
/// here. Locks held by this process are invisible to the probe.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FcntlLockCheck;

#[cfg(unix)]
impl LockCheck for FcntlLockCheck {
    fn is_locked(&self, path: &Path) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::File::open(path)?;

        // SAFETY: flock is plain old data; all-zero is a valid value.
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = libc::F_RDLCK as libc::c_short;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        lock.l_start = 0;
        lock.l_len = 0;

        // SAFETY: the fd is open for the duration of the call and `lock` is a
        // valid, exclusively borrowed flock struct.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut lock) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(lock.l_type == libc::F_WRLCK as libc::c_short)
    }
}

/// The platform's lock probe, or `None` where none is available
pub fn platform_lock_check() -> Option<Box<dyn LockCheck>> {
    #[cfg(unix)]
    {
        Some(Box::new(FcntlLockCheck))
    }
    #[cfg(not(unix))]
    {
        None
    }
}
