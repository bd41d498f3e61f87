//! # statefile
//!
//! Interruptible advisory file locks and atomic, lock-coordinated state
//! files for programs that share small on-disk state on a single host:
//! PID files, state snapshots, configuration caches.
//!
//! ## Features
//!
//! - **Interruptible Locking**: Shared and exclusive whole-file advisory
//!   locks whose blocking acquisitions can be cancelled through a
//!   [`CancelToken`], without leaving a stuck thread behind
//! - **Atomic Stores**: Values are staged in a sidecar file and renamed into
//!   place, so no reader or crash ever observes a half-written file
//! - **Compare-and-Swap Updates**: [`Store::load_and_store`] retries
//!   read-modify-write cycles whenever a concurrent writer got in between,
//!   using the file's identity (inode or file index) as the conflict detector
//! - **Pluggable Codec**: The encoder/decoder pair is injected and opaque;
//!   [`Store::json`] covers the common serde-JSON case
//! - **Cross-Platform**: Linux and Windows interrupt a blocked kernel wait
//!   directly; other Unixes fall back to racing a detached acquisition
//!
//! ## Quick Start
//!
//! ```no_run
//! use statefile::{CancelToken, LockFile, Store};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Plain locking: serialize access to a shared file.
//! let token = CancelToken::new();
//! let file = LockFile::create("/tmp/app.pid")?;
//! statefile::lock(&token, &file).await?;
//! // ... critical section ...
//! statefile::unlock(&file)?;
//!
//! // Atomic state: increment a counter from any number of processes.
//! let counter = Store::<u64>::json();
//! counter
//!     .load_and_store(&token, "/tmp/app.counter", 0o644, |_, count, _| {
//!         *count += 1;
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into a few core modules:
//!
//! - [`cancel`] - Cancellation tokens consumed by every blocking operation
//! - [`handle`] - The [`LockFile`] handle locks are keyed on
//! - [`lock`] - The interruptible lock engine
//! - [`store`] - The atomic store engine with compare-and-swap updates
//!
//! Locks are advisory: they coordinate processes that use this lock
//! convention and do not stop anyone from bypassing it with plain reads and
//! writes. Locking is whole-file and not re-entrant: re-acquiring on the
//! same handle promotes or demotes the lock rather than nesting it.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Cancellation tokens for interruptible operations
pub mod cancel;

/// Error types shared by the lock and store engines
pub mod error;

/// File handles accepted by the lock and store engines
pub mod handle;

/// Interruptible advisory whole-file locks
pub mod lock;

/// Atomic load/store of serialized values
pub mod store;

mod sys;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use error::{BoxError, Error};
pub use handle::LockFile;
pub use lock::{lock, rlock, try_lock, try_rlock, unlock};
pub use store::{Canary, Store};
