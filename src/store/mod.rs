//! Atomic load/store of serialized values with compare-and-swap semantics.
//!
//! A [`Store`] binds a value type to an injected encoder/decoder pair and
//! moves values of that type in and out of a file such that no reader ever
//! observes a truncated or half-written file, even across crashes and
//! concurrent writers.
//!
//! # How a store works
//!
//! New content is staged in a sidecar file `<path>.lock`, which doubles as
//! the writer lock: holding the exclusive lock on the sidecar *is* the right
//! to write, so staging and mutual exclusion share one critical section.
//! Once the value is encoded, the sidecar is renamed onto the destination,
//! atomically on every supported platform, including over a destination
//! other processes hold open. A writer that dies before the rename leaves the
//! destination untouched; its abandoned sidecar is reused (and truncated,
//! under the lock) by the next writer.
//!
//! # How racing writers are detected
//!
//! [`Store::load`] returns a [`Canary`]: the identity of the file it read
//! (inode number or file index). [`Store::store`] compares the destination's
//! current identity against the canary before committing; a rename by
//! another writer changes the identity, which is exactly the event the
//! comparison must detect. [`Store::load_and_store`] runs the resulting
//! load/modify/store cycle in a retry loop, giving compare-and-swap
//! semantics over arbitrary read-modify-write updates.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{BoxError, Error};
use crate::handle::LockFile;
use crate::lock;
use crate::sys;

/// Identity token computed by [`Store::load`] and consumed by
/// [`Store::store`] to detect that the file was replaced by another writer
/// in between.
///
/// The default value denotes "the file did not exist at load time"; a store
/// performed with it insists the file still does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Canary(u64);

impl Canary {
    /// Whether this canary recorded an absent file.
    pub fn is_missing(&self) -> bool {
        self.0 == 0
    }
}

type EncodeFn<T> = Box<dyn Fn(&mut dyn Write, &T) -> Result<(), BoxError> + Send + Sync>;
type DecodeFn<T> = Box<dyn Fn(&mut dyn Read, &mut T) -> Result<(), BoxError> + Send + Sync>;

/// Marshals and unmarshals values of type `T` atomically from and to the
/// file system.
///
/// The codec is injected at construction and treated as opaque: the store
/// neither inspects nor constrains its output. [`Store::json`] wires up the
/// common serde-JSON case.
///
/// ```no_run
/// use statefile::{CancelToken, Store};
///
/// #[derive(Default, serde::Serialize, serde::Deserialize)]
/// struct State {
///     generation: u64,
/// }
///
/// # async fn example() -> Result<(), statefile::Error> {
/// let store = Store::<State>::json();
/// let token = CancelToken::new();
/// store
///     .load_and_store(&token, "/var/lib/app/state.json", 0o644, |_, state, _| {
///         state.generation += 1;
///         Ok(())
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Store<T> {
    encode: EncodeFn<T>,
    decode: DecodeFn<T>,
}

impl<T> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl<T> Store<T> {
    /// Create a store from an encoder and a decoder.
    ///
    /// `encode` writes a value to a byte sink; `decode` reads one from a
    /// byte source into the provided value. Failures are passed through to
    /// the caller unchanged, wrapped as [`Error::Encode`] / [`Error::Decode`].
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&mut dyn Write, &T) -> Result<(), BoxError> + Send + Sync + 'static,
        D: Fn(&mut dyn Read, &mut T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            encode: Box::new(encode),
            decode: Box::new(decode),
        }
    }

    /// Read the file at `path` under a shared lock and decode it into
    /// `value`, returning the canary identifying what was read.
    ///
    /// May block while another store is writing the file; the block is
    /// cancellable through `token`. A missing file surfaces as an error for
    /// which [`Error::is_not_found`] returns true. If decoding fails partway
    /// through, `value` may have been partially overwritten.
    pub async fn load(
        &self,
        token: &CancelToken,
        path: impl AsRef<Path>,
        value: &mut T,
    ) -> Result<Canary, Error> {
        let path = path.as_ref();
        token.check()?;

        let file =
            LockFile::open(path).map_err(|err| Error::from(err).with_path("open", path))?;
        lock::rlock(token, &file).await?;
        token.check()?;

        let mut reader = io::BufReader::new(file.file());
        (self.decode)(&mut reader, value).map_err(Error::Decode)?;

        let id = sys::file_id(file.file()).map_err(|err| err.with_path("stat", path))?;
        // The shared lock dies with `file`: closing the only descriptor of
        // the open file description releases it.
        Ok(Canary(id))
    }

    /// Encode `value` and atomically install it at `path`, creating the file
    /// with the given Unix permission bits if needed (ignored on Windows).
    ///
    /// Either all of the new content becomes visible or none of it; a reader
    /// never observes a truncated file, and a crash mid-store leaves the
    /// previous content in place.
    ///
    /// `canary` makes the store conditional: `None` stores unconditionally,
    /// `Some` insists the destination is still the file (or the absence)
    /// that [`Store::load`] observed, failing with an error for which
    /// [`Error::is_retry`] returns true otherwise.
    pub async fn store(
        &self,
        token: &CancelToken,
        path: impl AsRef<Path>,
        mode: u32,
        value: &T,
        canary: Option<Canary>,
    ) -> Result<(), Error> {
        let path = path.as_ref();
        token.check()?;

        let lock_path = sidecar_path(path);
        let sidecar = LockFile::create_sidecar(&lock_path, mode)
            .map_err(|err| Error::from(err).with_path("open", &lock_path))?;

        // The staging file must disappear on every exit path except a
        // successful rename, which consumes its name. The guard is armed
        // only once the lock is ours: a waiter that never acquired it may be
        // looking at another writer's live staging file, which must survive.
        // An unremoved sidecar is harmless; the next writer reuses it.
        let mut cleanup = SidecarCleanup {
            sidecar: &sidecar,
            armed: false,
        };
        lock::lock(token, &sidecar).await?;
        cleanup.armed = true;

        self.write_locked(path, &sidecar, value, canary)?;
        cleanup.armed = false;
        Ok(())
    }

    /// The critical section: runs with the exclusive lock on the sidecar held.
    fn write_locked(
        &self,
        path: &Path,
        sidecar: &LockFile,
        value: &T,
        canary: Option<Canary>,
    ) -> Result<(), Error> {
        if let Some(canary) = canary {
            let current = sys::path_id(path).map_err(|err| err.with_path("stat", path))?;
            if Canary(current.unwrap_or_default()) != canary {
                debug!(
                    path = %path.display(),
                    "destination changed since it was loaded"
                );
                return Err(Error::Retry);
            }
        }

        if rug_pulled(sidecar)? {
            return Err(Error::Retry);
        }

        // An aborted writer may have left stale bytes in the sidecar; we
        // hold the exclusive lock, so truncating here is race-free.
        sidecar
            .file()
            .set_len(0)
            .map_err(|err| Error::from(err).with_path("truncate", sidecar.path()))?;

        let mut writer = io::BufWriter::new(sidecar.file());
        (self.encode)(&mut writer, value).map_err(Error::Encode)?;
        writer
            .flush()
            .map_err(|err| Error::from(err).with_path("write", sidecar.path()))?;

        sys::rename_over(sidecar.file(), sidecar.path(), path)
            .map_err(|err| err.with_path("rename", path))
    }

    /// Load the file at `path`, hand the result to `apply`, and store the
    /// modified value back, retrying the whole cycle whenever another
    /// writer got in between. Compare-and-swap for files.
    ///
    /// `apply` is always invoked, even when the load failed: it then
    /// receives a zero value and the load error, which is how "the file does
    /// not exist yet" turns into "create it". Returning an error from
    /// `apply` (see [`Error::other`]) aborts the cycle and surfaces that
    /// error.
    ///
    /// The retry count is unbounded; under sustained contention this has the
    /// usual optimistic-CAS liveness, with progress guaranteed because every
    /// retry is caused by some other writer having completed.
    pub async fn load_and_store<F>(
        &self,
        token: &CancelToken,
        path: impl AsRef<Path>,
        mode: u32,
        mut apply: F,
    ) -> Result<(), Error>
    where
        T: Default,
        F: FnMut(&CancelToken, &mut T, Option<&Error>) -> Result<(), Error>,
    {
        let path = path.as_ref();
        loop {
            let mut value = T::default();
            let (canary, load_err) = match self.load(token, path, &mut value).await {
                Ok(canary) => (Some(canary), None),
                Err(err) if err.is_not_found() => (Some(Canary::default()), Some(err)),
                // Unreadable contents: there is no identity worth defending,
                // so the store below overwrites unconditionally.
                Err(err) => (None, Some(err)),
            };

            apply(token, &mut value, load_err.as_ref())?;

            match self.store(token, path, mode, &value, canary).await {
                Err(err) if err.is_retry() => {
                    debug!(
                        path = %path.display(),
                        "store raced with a concurrent writer, retrying"
                    );
                }
                result => return result,
            }
        }
    }
}

impl<T: Serialize + DeserializeOwned> Store<T> {
    /// A store using JSON via serde for both directions.
    pub fn json() -> Self {
        Self::new(
            |writer: &mut dyn Write, value: &T| {
                serde_json::to_writer(writer, value).map_err(BoxError::from)
            },
            |reader: &mut dyn Read, value: &mut T| {
                *value = serde_json::from_reader(reader).map_err(BoxError::from)?;
                Ok(())
            },
        )
    }
}

/// Detects that our sidecar handle no longer lives at the sidecar name.
///
/// That happens when another store completed its rename between our open of
/// `<path>.lock` and our lock acquisition: we then hold an exclusive lock on
/// what is now the destination (or an orphaned inode), not on anyone's
/// staging file, and the only correct move is to start over.
fn rug_pulled(sidecar: &LockFile) -> Result<bool, Error> {
    let held = sys::file_id(sidecar.file())?;
    match sys::path_id(sidecar.path())? {
        None => Ok(true),
        Some(current) => Ok(held != current),
    }
}

/// `<path>.lock`, appended to the full file name rather than replacing its
/// extension.
fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

struct SidecarCleanup<'a> {
    sidecar: &'a LockFile,
    armed: bool,
}

impl Drop for SidecarCleanup<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Only remove the name while it still refers to our staging file.
        // After a rug pull it refers to another writer's, and unlinking that
        // would fail their rename out from under them.
        match rug_pulled(self.sidecar) {
            Ok(false) => {
                if let Err(err) = fs::remove_file(self.sidecar.path()) {
                    if err.kind() != io::ErrorKind::NotFound {
                        warn!(
                            path = %self.sidecar.path().display(),
                            error = %err,
                            "failed to remove staging file"
                        );
                    }
                }
            }
            Ok(true) | Err(_) => {}
        }
    }
}
