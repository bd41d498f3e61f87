//! Linux realization of the interruptible-lock and file-identity primitives.
//!
//! A thread blocked in `flock(2)` has no cancellable or timed variant; the
//! only portable way to unblock it is a signal delivered to that exact
//! thread with `SA_RESTART` disabled, so the syscall returns `EINTR`
//! instead of silently restarting.
//!
//! The signal is `SIGURG`. It is passed through by debuggers by default, it
//! is not reserved by libc internals (unlike the real-time signals glibc
//! claims for thread cancellation and setxid), and a spurious delivery has
//! no consequence, which matters because the watcher may fire a hair after
//! the lock call already returned. No Rust runtime claims signals for
//! scheduling, so disabling auto-restart on it breaks nothing else.

use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::ptr;

use crate::error::Error;

pub(crate) const SUPPORTS_INTERRUPT: bool = true;

const INTERRUPT_SIGNAL: libc::c_int = libc::SIGURG;

/// The signal only has to knock the thread out of the kernel; the handler
/// body is irrelevant.
extern "C" fn wakeup(_signo: libc::c_int) {}

static HANDLER: OnceCell<Result<(), i32>> = OnceCell::new();

/// Install the wakeup handler, once per process.
///
/// The existing disposition is preserved where possible: only default or
/// ignored dispositions are replaced with the no-op handler (an ignored
/// signal never interrupts a syscall), and `SA_RESTART` is cleared either
/// way so `flock` reports `EINTR`.
fn ensure_interrupt_handler() -> Result<(), Error> {
    let result = HANDLER.get_or_init(|| unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        if libc::sigaction(INTERRUPT_SIGNAL, ptr::null(), &mut action) != 0 {
            return Err(io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }
        if action.sa_sigaction == libc::SIG_DFL || action.sa_sigaction == libc::SIG_IGN {
            action.sa_sigaction = wakeup as extern "C" fn(libc::c_int) as libc::sighandler_t;
        }
        action.sa_flags &= !libc::SA_RESTART;
        if libc::sigaction(INTERRUPT_SIGNAL, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }
        Ok(())
    });
    match result {
        Ok(()) => Ok(()),
        Err(errno) => Err(Error::syscall(
            "sigaction",
            io::Error::from_raw_os_error(*errno),
        )),
    }
}

/// Addresses one OS thread so [`interrupt`](ThreadToken::interrupt) can
/// target it from another task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadToken {
    pid: libc::pid_t,
    tid: libc::pid_t,
}

impl ThreadToken {
    /// Capture the calling thread. Must be called on the thread that will
    /// issue the blocking lock syscall.
    pub(crate) fn current() -> Result<Self, Error> {
        ensure_interrupt_handler()?;
        let pid = unsafe { libc::getpid() };
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
        Ok(Self { pid, tid })
    }

    /// Deliver the wakeup signal to the captured thread.
    pub(crate) fn interrupt(&self) -> Result<(), Error> {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                self.pid as libc::c_long,
                self.tid as libc::c_long,
                INTERRUPT_SIGNAL as libc::c_long,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        Err(Error::syscall("tgkill", io::Error::last_os_error()))
    }
}

pub(crate) fn file_id(file: &File) -> Result<u64, Error> {
    statx_ino(file.as_raw_fd(), None)
}

pub(crate) fn path_id(path: &Path) -> Result<Option<u64>, Error> {
    match statx_ino(libc::AT_FDCWD, Some(path)) {
        Ok(ino) => Ok(Some(ino)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Inode number via `statx(STATX_INO)`, which asks the kernel for the
/// identity field alone, falling back to `fstat`/`lstat` when the syscall is
/// not implemented (old kernels report `ENOSYS`).
fn statx_ino(dirfd: RawFd, path: Option<&Path>) -> Result<u64, Error> {
    let pathname = match path {
        Some(path) => cstring(path)?,
        None => CString::default(),
    };
    let mut flags = libc::AT_SYMLINK_NOFOLLOW;
    if path.is_none() {
        flags |= libc::AT_EMPTY_PATH;
    }

    let mut stx: libc::statx = unsafe { mem::zeroed() };
    let rc = unsafe {
        libc::statx(dirfd, pathname.as_ptr(), flags, libc::STATX_INO, &mut stx)
    };
    if rc == 0 {
        return Ok(stx.stx_ino);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOSYS) {
        return Err(Error::syscall("statx", err));
    }

    match path {
        Some(_) => {
            let mut stat: libc::stat = unsafe { mem::zeroed() };
            if unsafe { libc::lstat(pathname.as_ptr(), &mut stat) } != 0 {
                return Err(Error::syscall("lstat", io::Error::last_os_error()));
            }
            Ok(stat.st_ino)
        }
        None => {
            let mut stat: libc::stat = unsafe { mem::zeroed() };
            if unsafe { libc::fstat(dirfd, &mut stat) } != 0 {
                return Err(Error::syscall("fstat", io::Error::last_os_error()));
            }
            Ok(stat.st_ino)
        }
    }
}

fn cstring(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        Error::from(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains an interior NUL byte",
        ))
    })
}
