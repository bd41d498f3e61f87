//! Integration tests for the interruptible lock engine.

use statefile::{CancelToken, LockFile};
use std::time::Duration;
use tempfile::TempDir;

/// Two independent handles on the same underlying file.
fn lockfile_pair(dir: &TempDir, name: &str) -> (LockFile, LockFile) {
    let path = dir.path().join(name);
    let f1 = LockFile::create(&path).expect("failed to open first handle");
    let f2 = LockFile::create(&path).expect("failed to open second handle");
    (f1, f2)
}

#[tokio::test]
async fn test_exclusive_lock_blocks_second_handle() {
    let dir = TempDir::new().unwrap();
    let (f1, f2) = lockfile_pair(&dir, "exclusive");
    let token = CancelToken::new();

    statefile::lock(&token, &f1).await.unwrap();

    let err = statefile::try_lock(&f2).unwrap_err();
    assert!(err.is_would_block(), "unexpected error: {err}");

    statefile::unlock(&f1).unwrap();
    statefile::try_lock(&f2).unwrap();
    statefile::unlock(&f2).unwrap();
}

#[test]
fn test_shared_locks_coexist_exclusive_does_not() {
    let dir = TempDir::new().unwrap();
    let (f1, f2) = lockfile_pair(&dir, "shared");

    // Read-locking multiple handles of the same file succeeds.
    statefile::try_rlock(&f1).unwrap();
    statefile::try_rlock(&f2).unwrap();

    // Promoting while another shared lock is held would block.
    let err = statefile::try_lock(&f2).unwrap_err();
    assert!(err.is_would_block(), "unexpected error: {err}");

    // Promoting once the other holder is gone works.
    statefile::unlock(&f1).unwrap();
    statefile::try_lock(&f2).unwrap();
    let err = statefile::try_lock(&f1).unwrap_err();
    assert!(err.is_would_block(), "unexpected error: {err}");

    // Demoting the exclusive lock back to shared lets readers in again.
    statefile::try_rlock(&f2).unwrap();
    statefile::try_rlock(&f1).unwrap();
}

#[tokio::test]
async fn test_relock_on_same_handle_is_not_reentrant() {
    let dir = TempDir::new().unwrap();
    let (f1, f2) = lockfile_pair(&dir, "relock");
    let token = CancelToken::new();

    statefile::lock(&token, &f1).await.unwrap();
    statefile::lock(&token, &f1).await.unwrap();

    let err = statefile::try_lock(&f2).unwrap_err();
    assert!(err.is_would_block(), "unexpected error: {err}");

    // A single unlock releases it; the second lock call did not nest.
    statefile::unlock(&f1).unwrap();
    statefile::try_lock(&f2).unwrap();
}

#[tokio::test]
async fn test_lock_with_cancelled_token_returns_cause() {
    let dir = TempDir::new().unwrap();
    let (f1, f2) = lockfile_pair(&dir, "pre-cancelled");

    let token = CancelToken::new();
    token.cancel_with("deadline exceeded");

    let err = statefile::lock(&token, &f1).await.unwrap_err();
    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert!(err.to_string().contains("deadline exceeded"));

    // The cancelled call never acquired anything.
    statefile::try_lock(&f2).unwrap();
}

// On Windows every lock call starts by unlocking, so a failed call leaves
// the handle unlocked rather than preserving the previous state.
#[cfg(not(windows))]
#[tokio::test]
async fn test_cancelled_promotion_preserves_shared_lock() {
    let dir = TempDir::new().unwrap();
    let (f1, f2) = lockfile_pair(&dir, "preserved");

    statefile::try_rlock(&f1).unwrap();

    let token = CancelToken::new();
    token.cancel();
    statefile::lock(&token, &f1).await.unwrap_err();

    // f1 still holds its shared lock, so an exclusive attempt elsewhere blocks.
    let err = statefile::try_lock(&f2).unwrap_err();
    assert!(err.is_would_block(), "unexpected error: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_unblocks_waiting_lock() {
    let dir = TempDir::new().unwrap();
    let (f1, f2) = lockfile_pair(&dir, "blocked");

    let holder_token = CancelToken::new();
    statefile::lock(&holder_token, &f1).await.unwrap();

    let cancel = CancelToken::new();
    let waiter = tokio::spawn({
        let cancel = cancel.clone();
        async move { statefile::lock(&cancel, &f2).await }
    });

    // Give the waiter time to actually block in the kernel.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished(), "waiter returned before cancellation");

    cancel.cancel_with("test requested stop");

    // The waiter must return without the holder ever releasing.
    let result = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .expect("cancelled lock call did not return in time")
        .unwrap();
    let err = result.unwrap_err();
    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert!(err.to_string().contains("test requested stop"));

    statefile::unlock(&f1).unwrap();
}

/// An unrelated signal delivered while a lock call blocks is a spurious
/// wakeup: the call must keep waiting instead of surfacing an error.
#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrelated_signal_does_not_interrupt_lock() {
    let dir = TempDir::new().unwrap();
    let (f1, f2) = lockfile_pair(&dir, "spurious");

    let token = CancelToken::new();
    statefile::lock(&token, &f1).await.unwrap();

    let waiter_token = CancelToken::new();
    let waiter = tokio::spawn({
        let waiter_token = waiter_token.clone();
        async move { statefile::lock(&waiter_token, &f2).await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Pepper the process with the wakeup signal; none of these deliveries
    // carry a cancellation, so the waiter must stay blocked.
    for _ in 0..5 {
        unsafe {
            libc::kill(libc::getpid(), libc::SIGURG);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!waiter.is_finished(), "spurious signal surfaced to the caller");

    statefile::unlock(&f1).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .expect("waiter did not acquire the lock after release")
        .unwrap();
    result.unwrap();
}
