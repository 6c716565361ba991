use std::future::Future;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use super::errors::{Result, UploadError};

/// Cancellation handle owned by one upload record.
///
/// Cancelling a context cancels every context derived from it with
/// [`CancelContext::child`], never its parent or siblings.
#[derive(Debug, Clone, Default)]
pub struct CancelContext {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the context was already cancelled; the first
    /// reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() || self.token.is_cancelled() {
                return false;
            }
            *slot = Some(reason.into());
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn child(&self) -> CancelContext {
        CancelContext {
            token: self.token.child_token(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Drives `future` until it finishes or the context is cancelled.
    pub async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(UploadError::Cancelled),
            result = future => result,
        }
    }
}
