//! Non-Linux Unix (macOS and the BSDs): no reliable per-thread interrupt.
//!
//! Darwin offers no way to knock a thread out of a blocked `flock(2)` that
//! cooperates with user-space runtimes (a Mach exception aimed at the thread
//! does not unwind cleanly through them). The lock engine detects
//! [`SUPPORTS_INTERRUPT`] `== false` and falls back to racing a detached
//! blocking acquisition against the cancellation token instead.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::Error;

pub(crate) const SUPPORTS_INTERRUPT: bool = false;

/// Stub: never used to deliver an interrupt on this platform, but the lock
/// engine is written against a uniform surface.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadToken;

impl ThreadToken {
    pub(crate) fn current() -> Result<Self, Error> {
        Ok(Self)
    }

    pub(crate) fn interrupt(&self) -> Result<(), Error> {
        Ok(())
    }
}

pub(crate) fn file_id(file: &File) -> Result<u64, Error> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(file.as_raw_fd(), &mut stat) } != 0 {
        return Err(Error::syscall("fstat", io::Error::last_os_error()));
    }
    Ok(stat.st_ino)
}

pub(crate) fn path_id(path: &Path) -> Result<Option<u64>, Error> {
    let pathname = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        Error::from(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains an interior NUL byte",
        ))
    })?;

    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::lstat(pathname.as_ptr(), &mut stat) } == 0 {
        return Ok(Some(stat.st_ino));
    }

    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::NotFound {
        return Ok(None);
    }
    Err(Error::syscall("lstat", err))
}
