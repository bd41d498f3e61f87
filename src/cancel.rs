//! Cancellation tokens for interruptible operations.
//!
//! A [`CancelToken`] is a lightweight handle that can be shared across tasks
//! and threads to request that an in-flight lock acquisition or store
//! operation stop early. The library only ever consumes tokens; it is up to
//! the caller to create one and wire it to whatever triggers cancellation
//! (Ctrl+C, a deadline, a supervisor).

use once_cell::sync::OnceCell;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::Error;

const DEFAULT_REASON: &str = "operation cancelled";

/// A cloneable cancellation token carrying a user-visible cause.
///
/// Clones share state: cancelling any clone cancels them all. A token can be
/// polled with [`is_cancelled`](CancelToken::is_cancelled) and awaited with
/// [`cancelled`](CancelToken::cancelled). Cancellation is one-way and
/// idempotent; the first cancel wins the reason.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: OnceCell<Arc<str>>,
    notify: Notify,
}

impl CancelToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token with a generic reason. Notifies all waiters.
    pub fn cancel(&self) {
        self.cancel_with(DEFAULT_REASON);
    }

    /// Cancel the token with the given reason. Notifies all waiters.
    ///
    /// Later calls are no-ops; the reason of the first call sticks.
    pub fn cancel_with(&self, reason: impl Into<Arc<str>>) {
        let _ = self.inner.reason.set(reason.into());
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The cancellation reason, once cancelled.
    pub fn reason(&self) -> Option<Arc<str>> {
        if !self.is_cancelled() {
            return None;
        }
        Some(
            self.inner
                .reason
                .get()
                .cloned()
                .unwrap_or_else(|| Arc::from(DEFAULT_REASON)),
        )
    }

    /// Wait until the token is cancelled. Returns immediately if it already is.
    pub async fn cancelled(&self) {
        // Register interest before re-checking the flag, so a cancel that
        // lands between the check and the await still wakes us.
        let mut notified = pin!(self.inner.notify.notified());
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Error-returning poll used at the suspension points of the engines.
    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(self.cancel_error());
        }
        Ok(())
    }

    /// The error this token produces once cancelled.
    pub(crate) fn cancel_error(&self) -> Error {
        Error::Cancelled {
            reason: self.reason().unwrap_or_else(|| Arc::from(DEFAULT_REASON)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent_and_first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);

        token.cancel_with("deadline exceeded");
        token.cancel_with("second reason, ignored");

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        // Give the waiter a chance to park first.
        tokio::task::yield_now().await;
        token.cancel_with("stop");
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("waiter should wake after cancel")
            .unwrap();
    }

    #[test]
    fn test_cancel_error_carries_reason() {
        let token = CancelToken::new();
        token.cancel_with("shutting down");
        let err = token.cancel_error();
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("shutting down"));
    }
}
