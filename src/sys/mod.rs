//! Platform lock and I/O primitives.
//!
//! Each supported OS provides the same crate-internal surface: a raw
//! non-interruptible lock/unlock pair, a way to address the current OS
//! thread so another task can knock it out of a blocked lock syscall, and
//! the file-identity and rename primitives the store engine builds on.
//!
//! The raw operations here know nothing about cancellation; the lock engine
//! in [`crate::lock`] supplies that on top.

use crate::error::Error;

#[cfg(unix)]
mod unix;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::{file_id, path_id, ThreadToken, SUPPORTS_INTERRUPT};

#[cfg(all(unix, not(target_os = "linux")))]
mod macos;
#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) use macos::{file_id, path_id, ThreadToken, SUPPORTS_INTERRUPT};

#[cfg(unix)]
pub(crate) use unix::{pre_lock, raw_lock, raw_unlock, rename_over, shared_options};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::{
    file_id, path_id, pre_lock, raw_lock, raw_unlock, rename_over, shared_options, ThreadToken,
    SUPPORTS_INTERRUPT,
};

/// Outcome of a failed raw lock attempt.
#[derive(Debug)]
pub(crate) enum RawLockError {
    /// The non-blocking attempt could not be satisfied without waiting.
    WouldBlock,
    /// A signal or I/O cancellation knocked the blocked call out of the
    /// kernel. The caller decides whether this was our interrupt or a
    /// spurious wakeup.
    Interrupted,
    /// Any other syscall failure.
    Other(Error),
}
