//! Windows realization of the lock, interrupt, and rename primitives.
//!
//! Locks use the overlapped `LockFileEx` API over the whole file range. A
//! blocked call is woken by `CancelSynchronousIo` aimed at a duplicated
//! handle of the waiting thread, which makes the call fail with
//! `ERROR_OPERATION_ABORTED`, the moral equivalent of `EINTR`.
//!
//! Replacing the destination of a store requires a POSIX-semantics rename
//! (`SetFileInformationByHandle` with `FileRenameInfoEx`): `MoveFileEx`, and
//! therefore `std::fs::rename`, refuses to replace a destination that other
//! processes hold open, which is exactly the situation a live store is in.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use std::path::Path;

use windows_sys::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, ERROR_LOCK_VIOLATION, ERROR_NOT_FOUND,
    ERROR_OPERATION_ABORTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
};
use windows_sys::Win32::Storage::FileSystem::{
    FileRenameInfoEx, GetFileInformationByHandle, LockFileEx, SetFileInformationByHandle,
    UnlockFileEx, BY_HANDLE_FILE_INFORMATION, DELETE, FILE_FLAG_OPEN_REPARSE_POINT,
    FILE_RENAME_FLAG_POSIX_SEMANTICS, FILE_RENAME_FLAG_REPLACE_IF_EXISTS, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetCurrentThread};
use windows_sys::Win32::System::IO::{CancelSynchronousIo, OVERLAPPED};

use crate::error::Error;
use crate::sys::RawLockError;

pub(crate) const SUPPORTS_INTERRUPT: bool = true;

const SHARE_ALL: u32 = FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE;

/// Every open asks for full sharing (so a concurrent store can replace the
/// file under us) and the `DELETE` access right (so the handle itself can be
/// renamed over the destination).
pub(crate) fn shared_options(read: bool, write: bool) -> OpenOptions {
    let mut access = DELETE;
    if read {
        access |= GENERIC_READ;
    }
    if write {
        access |= GENERIC_WRITE;
    }
    let mut options = OpenOptions::new();
    options
        .read(read)
        .write(write)
        .access_mode(access)
        .share_mode(SHARE_ALL);
    options
}

fn handle(file: &File) -> HANDLE {
    file.as_raw_handle() as HANDLE
}

pub(crate) fn raw_lock(
    file: &File,
    exclusive: bool,
    blocking: bool,
) -> Result<(), RawLockError> {
    let mut flags = 0;
    if exclusive {
        flags |= LOCKFILE_EXCLUSIVE_LOCK;
    }
    if !blocking {
        flags |= LOCKFILE_FAIL_IMMEDIATELY;
    }

    let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
    let ok = unsafe { LockFileEx(handle(file), flags, 0, u32::MAX, u32::MAX, &mut overlapped) };
    if ok != 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == ERROR_OPERATION_ABORTED as i32 => Err(RawLockError::Interrupted),
        Some(code) if code == ERROR_LOCK_VIOLATION as i32 && !blocking => {
            Err(RawLockError::WouldBlock)
        }
        _ => Err(RawLockError::Other(Error::syscall("LockFileEx", err))),
    }
}

pub(crate) fn raw_unlock(file: &File) -> Result<(), Error> {
    let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
    if unsafe { UnlockFileEx(handle(file), 0, u32::MAX, u32::MAX, &mut overlapped) } != 0 {
        return Ok(());
    }
    Err(Error::syscall("UnlockFileEx", io::Error::last_os_error()))
}

/// A handle may hold a shared and an exclusive lock at once, and the lock
/// state cannot be queried, so promotion and demotion cannot be done in
/// place. Every lock operation therefore starts from a clean slate with an
/// unconditional unlock. A failed or cancelled call consequently leaves the
/// handle unlocked; this is the documented Windows relaxation.
pub(crate) fn pre_lock(file: &File) {
    let _ = raw_unlock(file);
}

/// Addresses one OS thread through a duplicated thread handle.
#[derive(Debug)]
pub(crate) struct ThreadToken(HANDLE);

// The duplicated handle is only ever used from the watcher task.
unsafe impl Send for ThreadToken {}

impl ThreadToken {
    /// Duplicate the calling thread's pseudo-handle into a real one that
    /// stays valid from another thread.
    pub(crate) fn current() -> Result<Self, Error> {
        let mut thread: HANDLE = 0;
        let ok = unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                GetCurrentThread(),
                GetCurrentProcess(),
                &mut thread,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == 0 {
            return Err(Error::syscall(
                "DuplicateHandle",
                io::Error::last_os_error(),
            ));
        }
        Ok(Self(thread))
    }

    /// Cancel the synchronous I/O the captured thread is blocked in.
    ///
    /// `ERROR_NOT_FOUND` means the thread was not in a cancellable wait at
    /// that instant; the caller retries until the waiter reports done.
    pub(crate) fn interrupt(&self) -> Result<(), Error> {
        if unsafe { CancelSynchronousIo(self.0) } != 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_NOT_FOUND as i32) {
            return Ok(());
        }
        Err(Error::syscall("CancelSynchronousIo", err))
    }
}

impl Drop for ThreadToken {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

pub(crate) fn file_id(file: &File) -> Result<u64, Error> {
    let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { mem::zeroed() };
    if unsafe { GetFileInformationByHandle(handle(file), &mut info) } == 0 {
        return Err(Error::syscall(
            "GetFileInformationByHandle",
            io::Error::last_os_error(),
        ));
    }
    Ok((info.nFileIndexHigh as u64) << 32 | info.nFileIndexLow as u64)
}

pub(crate) fn path_id(path: &Path) -> Result<Option<u64>, Error> {
    let open = OpenOptions::new()
        .access_mode(GENERIC_READ)
        .share_mode(SHARE_ALL)
        .custom_flags(FILE_FLAG_OPEN_REPARSE_POINT)
        .open(path);
    match open {
        Ok(file) => file_id(&file).map(Some),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::from(err)),
    }
}

/// Header of `FILE_RENAME_INFO`, used to compute the offset at which the
/// inline file name begins.
#[repr(C)]
struct RenameInfo {
    flags: u32,
    root_directory: HANDLE,
    file_name_length: u32,
    file_name: [u16; 1],
}

/// Rename by handle with `REPLACE_IF_EXISTS | POSIX_SEMANTICS`, replacing
/// the destination atomically even while other processes hold it open;
/// their descriptors stay attached to the old file.
pub(crate) fn rename_over(file: &File, _from: &Path, to: &Path) -> Result<(), Error> {
    let wide: Vec<u16> = to.as_os_str().encode_wide().chain(Some(0)).collect();

    let mut header: RenameInfo = unsafe { mem::zeroed() };
    header.flags = FILE_RENAME_FLAG_REPLACE_IF_EXISTS | FILE_RENAME_FLAG_POSIX_SEMANTICS;
    header.file_name_length = ((wide.len() - 1) * 2) as u32;

    let name_offset = mem::offset_of!(RenameInfo, file_name);
    let mut info = vec![0u8; name_offset + wide.len() * 2];
    info[..name_offset].copy_from_slice(unsafe {
        std::slice::from_raw_parts(&header as *const RenameInfo as *const u8, name_offset)
    });
    for (i, unit) in wide.iter().enumerate() {
        info[name_offset + 2 * i..name_offset + 2 * i + 2].copy_from_slice(&unit.to_le_bytes());
    }

    let ok = unsafe {
        SetFileInformationByHandle(
            handle(file),
            FileRenameInfoEx,
            info.as_ptr() as *const c_void,
            info.len() as u32,
        )
    };
    if ok == 0 {
        return Err(Error::syscall(
            "SetFileInformationByHandle",
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}
