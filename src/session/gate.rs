use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;

struct Inner {
    loading: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

/// Busy flag and cancellation switch of one [`super::ChatSession`].
///
/// Cheap to clone; a UI layer keeps one to cancel the turn on teardown.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                loading: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::Acquire)
    }

    /// Cancel the in-flight turn, if any. A later turn is not affected.
    pub fn cancel(&self) {
        self.inner.cancel.lock().cancel();
    }

    /// Claim the busy flag for one turn.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Busy` when another turn holds the flag.
    pub(crate) fn try_begin(&self) -> Result<TurnGuard, ChatError> {
        if self
            .inner
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChatError::Busy);
        }
        let token = CancellationToken::new();
        *self.inner.cancel.lock() = token.clone();
        Ok(TurnGuard {
            inner: Arc::clone(&self.inner),
            token,
        })
    }
}

/// Holds the busy flag until dropped, including when the turn future is
/// dropped mid-stream.
pub(crate) struct TurnGuard {
    inner: Arc<Inner>,
    token: CancellationToken,
}

impl TurnGuard {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.inner.loading.store(false, Ordering::Release);
    }
}
