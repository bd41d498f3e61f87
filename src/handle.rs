//! File handles accepted by the lock and store engines.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::sys;

/// An open file together with the path it was opened from.
///
/// This is the handle the lock engine operates on. The lock state belongs to
/// the underlying open file description, not to this value: a clone made with
/// [`File::try_clone`] shares it, and an explicit [`unlock`](crate::lock::unlock)
/// releases the lock for every duplicate. Dropping the last duplicate also
/// releases any lock held.
///
/// On Windows, every constructor opens the file with
/// `FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE` so that the file
/// can be atomically replaced while this handle is open.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Open an existing file read-only.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = sys::shared_options(true, false).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open a file read-write, creating it if it does not exist.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = sys::shared_options(true, true).create(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Wrap an already-open file. The path should be the one the file was
    /// opened from; it is used for lock bookkeeping and error messages.
    pub fn from_file(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
        }
    }

    /// Open a write-only staging file, creating it with the given Unix
    /// permission bits (file-type bits stripped; ignored on Windows).
    pub(crate) fn create_sidecar(path: &Path, mode: u32) -> io::Result<Self> {
        let mut options = sys::shared_options(false, true);
        options.create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode & 0o7777);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let file = options.open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// The underlying open file.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// The path this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consume the handle, returning the open file.
    pub fn into_file(self) -> File {
        self.file
    }

    /// Duplicate the underlying descriptor. The clone shares the open file
    /// description, and therefore the lock state.
    pub(crate) fn duplicate(&self) -> io::Result<File> {
        self.file.try_clone()
    }
}

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for LockFile {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(windows)]
impl std::os::windows::io::AsRawHandle for LockFile {
    fn as_raw_handle(&self) -> std::os::windows::io::RawHandle {
        use std::os::windows::io::AsRawHandle;
        self.file.as_raw_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = LockFile::open(dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handle");

        let created = LockFile::create(&path).unwrap();
        assert_eq!(created.path(), path.as_path());
        drop(created);

        let reopened = LockFile::open(&path).unwrap();
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn test_sidecar_is_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json.lock");

        let sidecar = LockFile::create_sidecar(&path, 0o644).unwrap();
        sidecar.file().write_all(b"staged").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"staged");
    }
}
