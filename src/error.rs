//! Error types shared by the lock and store engines.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Boxed error type used for opaque codec and callback failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by lock and store operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Acquiring the lock would block.
    #[error("acquiring the lock would block")]
    WouldBlock,

    /// The operation was cancelled through its [`CancelToken`](crate::CancelToken).
    #[error("operation cancelled: {reason}")]
    Cancelled {
        /// The cause the token was cancelled with.
        reason: Arc<str>,
    },

    /// The store raced with a concurrent writer and needs to be retried.
    ///
    /// [`Store::load_and_store`](crate::Store::load_and_store) consumes this
    /// internally; it only surfaces from a direct [`Store::store`](crate::Store::store)
    /// call made with a stale canary.
    #[error("the operation needs to be retried")]
    Retry,

    /// An I/O failure from open, stat, or rename.
    ///
    /// A load target that does not exist surfaces as this variant with
    /// [`std::io::ErrorKind::NotFound`].
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A lock, unlock, or identity syscall failed.
    #[error("{syscall}: {source}")]
    Syscall {
        /// Name of the failing syscall.
        syscall: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A failure tied to a specific file, tagged with the operation and path.
    #[error("{op} {path}: {source}")]
    Path {
        /// What the library was doing.
        op: &'static str,
        /// The file it was doing it to.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    /// The injected decoder failed; passed through opaquely.
    #[error("decode: {0}")]
    Decode(#[source] BoxError),

    /// The injected encoder failed; passed through opaquely.
    #[error("encode: {0}")]
    Encode(#[source] BoxError),

    /// An opaque error returned by a user callback.
    #[error(transparent)]
    Other(BoxError),
}

impl Error {
    /// Wrap a user-supplied error so it can be returned from a
    /// [`Store::load_and_store`](crate::Store::load_and_store) callback.
    pub fn other(err: impl Into<BoxError>) -> Self {
        Error::Other(err.into())
    }

    /// Whether this error means a non-blocking lock attempt would have to wait.
    ///
    /// Also recognizes raw [`io::Error`]s carrying the OS would-block code.
    pub fn is_would_block(&self) -> bool {
        match self.root() {
            Error::WouldBlock => true,
            Error::Io(err) => err.kind() == io::ErrorKind::WouldBlock,
            Error::Syscall { source, .. } => source.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }

    /// Whether this error was caused by a cancelled token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled { .. })
    }

    /// Whether this is the CAS retry sentinel.
    pub fn is_retry(&self) -> bool {
        matches!(self.root(), Error::Retry)
    }

    /// Whether the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::Io(err) => err.kind() == io::ErrorKind::NotFound,
            Error::Syscall { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Strip `Path` wrappers so kind checks see the underlying error.
    fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Path { source, .. } = err {
            err = source;
        }
        err
    }

    pub(crate) fn syscall(syscall: &'static str, source: io::Error) -> Self {
        Error::Syscall { syscall, source }
    }

    pub(crate) fn with_path(self, op: &'static str, path: &Path) -> Self {
        Error::Path {
            op,
            path: path.to_path_buf(),
            source: Box::new(self),
        }
    }
}

/// Wrap the error arm of a result with the operation name and path.
pub(crate) fn wrap_path<T>(
    op: &'static str,
    path: &Path,
    result: Result<T, Error>,
) -> Result<T, Error> {
    result.map_err(|err| err.with_path(op, path))
}
