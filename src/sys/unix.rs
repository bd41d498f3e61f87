//! Unix lock and I/O primitives shared by every Unix flavor.
//!
//! Locks are whole-file advisory `flock(2)` locks. They belong to the open
//! file description, so descriptors duplicated with `dup(2)` (or
//! [`File::try_clone`]) share lock state, and the lock dies when the last
//! duplicate closes.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::Error;
use crate::sys::RawLockError;

pub(crate) fn shared_options(read: bool, write: bool) -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(read).write(write);
    options
}

pub(crate) fn raw_lock(
    file: &File,
    exclusive: bool,
    blocking: bool,
) -> Result<(), RawLockError> {
    let mut flags = if exclusive {
        libc::LOCK_EX
    } else {
        libc::LOCK_SH
    };
    if !blocking {
        flags |= libc::LOCK_NB;
    }

    if unsafe { libc::flock(file.as_raw_fd(), flags) } == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) => Err(RawLockError::WouldBlock),
        Some(libc::EINTR) => Err(RawLockError::Interrupted),
        _ => Err(RawLockError::Other(Error::syscall("flock", err))),
    }
}

pub(crate) fn raw_unlock(file: &File) -> Result<(), Error> {
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } == 0 {
        return Ok(());
    }
    Err(Error::syscall("flock", io::Error::last_os_error()))
}

/// No lock-state reset is needed before locking on Unix; `flock` converts an
/// existing lock to the requested mode in place.
pub(crate) fn pre_lock(_file: &File) {}

/// Plain `rename(2)`: already atomic and replace-capable on POSIX.
pub(crate) fn rename_over(_file: &File, from: &Path, to: &Path) -> Result<(), Error> {
    std::fs::rename(from, to).map_err(Error::from)
}
