//! Interruptible advisory whole-file locks.
//!
//! Locks are keyed on the open file behind a [`LockFile`] handle: shared
//! locks (many readers) and exclusive locks (one writer), acquired blocking
//! or non-blocking. The blocking acquisitions take a [`CancelToken`] and
//! return early with the token's cause when it fires, even while the thread
//! is parked inside the kernel's lock wait.
//!
//! None of the kernel lock primitives can be cancelled portably. On Linux
//! the engine pins the syscall to one OS thread and has a watcher task
//! deliver a wakeup signal to exactly that thread; on Windows the watcher
//! cancels the thread's synchronous I/O; on other Unixes neither exists, so
//! the engine races a detached acquisition against the token and lets the
//! loser leak (see [`lock`] for the consequences).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{wrap_path, Error};
use crate::handle::LockFile;
use crate::sys::{self, RawLockError};

/// How often the watcher re-delivers the wakeup while the blocked call has
/// not yet reported back. A single delivery can be lost if it lands in the
/// window between the waiter polling its token and entering the kernel.
const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

/// Acquire (or promote an already-held lock to) an exclusive lock on the
/// file, blocking until it is available or `token` is cancelled.
///
/// Not re-entrant: a second `lock` on a handle already holding the exclusive
/// lock is a no-op, and on a handle holding a shared lock it is a promotion.
///
/// On Windows, every lock call first releases whatever lock the handle
/// holds, so a failed or cancelled call leaves the handle unlocked. On other
/// platforms a failed call leaves the previous lock state intact.
///
/// On platforms without interruptible kernel waits (macOS and the BSDs), a
/// cancelled call abandons its in-flight acquisition; if that acquisition
/// later succeeds in the background, the lock is held until the caller
/// closes the last duplicate of the handle.
pub async fn lock(token: &CancelToken, file: &LockFile) -> Result<(), Error> {
    wrap_path(
        "exclusive lock",
        file.path(),
        acquire(token, file, true).await,
    )
}

/// Acquire (or demote an already-held lock to) a shared lock on the file,
/// blocking until it is available or `token` is cancelled.
///
/// Not re-entrant; see [`lock`] for the promotion/demotion rules and the
/// Windows and macOS caveats, which apply equally here.
pub async fn rlock(token: &CancelToken, file: &LockFile) -> Result<(), Error> {
    wrap_path(
        "shared lock",
        file.path(),
        acquire(token, file, false).await,
    )
}

/// Attempt to acquire (or promote to) an exclusive lock without blocking.
///
/// Fails with an error for which [`Error::is_would_block`] returns true if
/// the lock is not immediately available. The Windows relaxation described
/// on [`lock`] applies: a failed attempt leaves the handle unlocked there.
pub fn try_lock(file: &LockFile) -> Result<(), Error> {
    wrap_path(
        "exclusive lock (non-blocking)",
        file.path(),
        try_acquire(file, true),
    )
}

/// Attempt to acquire (or demote to) a shared lock without blocking.
///
/// Fails with an error for which [`Error::is_would_block`] returns true if
/// an exclusive lock is held elsewhere.
pub fn try_rlock(file: &LockFile) -> Result<(), Error> {
    wrap_path(
        "shared lock (non-blocking)",
        file.path(),
        try_acquire(file, false),
    )
}

/// Release the lock held through this handle.
///
/// In almost all scenarios, closing the file is better: the lock belongs to
/// the open file description, so `unlock` releases it for *every* duplicate
/// of the descriptor, whereas closing releases it only once the last
/// duplicate is gone.
pub fn unlock(file: &LockFile) -> Result<(), Error> {
    wrap_path("unlock", file.path(), sys::raw_unlock(file.file()))
}

fn try_acquire(file: &LockFile, exclusive: bool) -> Result<(), Error> {
    sys::pre_lock(file.file());
    loop {
        match sys::raw_lock(file.file(), exclusive, false) {
            Ok(()) => return Ok(()),
            Err(RawLockError::WouldBlock) => return Err(Error::WouldBlock),
            // A non-blocking attempt interrupted by an unrelated signal is
            // simply retried; it cannot wait.
            Err(RawLockError::Interrupted) => continue,
            Err(RawLockError::Other(err)) => return Err(err),
        }
    }
}

async fn acquire(token: &CancelToken, file: &LockFile, exclusive: bool) -> Result<(), Error> {
    sys::pre_lock(file.file());
    token.check()?;

    if !sys::SUPPORTS_INTERRUPT {
        return acquire_detached(token, file, exclusive).await;
    }

    // The syscall loop runs on a dedicated blocking thread, which it owns
    // start to finish: that thread is the interrupt target, so nothing on it
    // may yield until the watcher is done.
    let file = file.duplicate()?;
    let done = Arc::new(AtomicBool::new(false));
    let (thread_tx, thread_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = std::sync::mpsc::channel();

    let watcher = tokio::spawn(watch(
        token.clone(),
        Arc::clone(&done),
        thread_rx,
        done_rx,
        exit_tx,
    ));

    let waiter_token = token.clone();
    let waiter = tokio::task::spawn_blocking(move || {
        let result = lock_on_thread(&waiter_token, &file, exclusive, thread_tx);
        done.store(true, Ordering::Release);
        let _ = done_tx.send(());
        // Keep this thread occupied until the watcher has either confirmed
        // it will not interrupt or finished interrupting. Released earlier,
        // the thread would return to the pool and a late wakeup signal
        // could strike unrelated work scheduled onto it.
        let _ = exit_rx.recv();
        result
    });

    let result = join_result(waiter.await);
    let _ = watcher.await;
    result
}

/// The syscall loop, executed on the pinned thread.
fn lock_on_thread(
    token: &CancelToken,
    file: &std::fs::File,
    exclusive: bool,
    thread_tx: oneshot::Sender<sys::ThreadToken>,
) -> Result<(), Error> {
    let thread = sys::ThreadToken::current()?;
    let _ = thread_tx.send(thread);

    loop {
        token.check()?;
        match sys::raw_lock(file, exclusive, true) {
            Ok(()) => return Ok(()),
            Err(RawLockError::Interrupted) => {
                if token.is_cancelled() {
                    return Err(token.cancel_error());
                }
                // An unrelated signal woke the syscall; retry.
                debug!("spurious wakeup during blocked lock, retrying");
            }
            Err(RawLockError::WouldBlock) => return Err(Error::WouldBlock),
            Err(RawLockError::Other(err)) => return Err(err),
        }
    }
}

/// Waits for whichever comes first: the waiter reporting done, or the token
/// cancelling. In the latter case it interrupts the pinned thread, and keeps
/// re-delivering until the waiter comes out, since a wakeup that lands
/// before the thread entered the kernel is lost.
async fn watch(
    token: CancelToken,
    done: Arc<AtomicBool>,
    thread_rx: oneshot::Receiver<sys::ThreadToken>,
    mut done_rx: oneshot::Receiver<()>,
    exit_tx: std::sync::mpsc::Sender<()>,
) {
    if let Ok(thread) = thread_rx.await {
        tokio::select! {
            _ = &mut done_rx => {}
            _ = token.cancelled() => {
                if !done.load(Ordering::Acquire) {
                    debug!("interrupting blocked lock acquisition");
                }
                while !done.load(Ordering::Acquire) {
                    if let Err(err) = thread.interrupt() {
                        // Failing to interrupt means the lock call can no
                        // longer be cancelled at all; that is a bug worth
                        // being loud about.
                        panic!("could not interrupt blocked lock call: {err}");
                    }
                    tokio::time::sleep(INTERRUPT_RETRY).await;
                }
            }
        }
    }
    let _ = exit_tx.send(());
}

/// Fallback for platforms that cannot interrupt a blocked lock call: run the
/// blocking acquisition on a detached task and race it against the token. A
/// cancelled race leaves the acquisition running; if it eventually succeeds
/// it holds the lock until the caller's handle is fully closed. Correctness
/// over resource cleanliness.
async fn acquire_detached(
    token: &CancelToken,
    file: &LockFile,
    exclusive: bool,
) -> Result<(), Error> {
    let file = file.duplicate()?;
    let mut acquisition = tokio::task::spawn_blocking(move || {
        loop {
            match sys::raw_lock(&file, exclusive, true) {
                Ok(()) => return Ok(()),
                Err(RawLockError::Interrupted) => continue,
                Err(RawLockError::WouldBlock) => return Err(Error::WouldBlock),
                Err(RawLockError::Other(err)) => return Err(err),
            }
        }
    });

    tokio::select! {
        biased;
        // When completion and cancellation arrive together, the completed
        // acquisition wins.
        result = &mut acquisition => join_result(result),
        _ = token.cancelled() => {
            warn!("lock wait cannot be interrupted on this platform; abandoning the acquisition");
            Err(token.cancel_error())
        }
    }
}

fn join_result(result: Result<Result<(), Error>, JoinError>) -> Result<(), Error> {
    match result {
        Ok(result) => result,
        Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
        Err(join) => Err(Error::other(join)),
    }
}
