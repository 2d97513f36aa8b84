//! Cooperative per-job cancellation.

use crate::error::{ExportError, Result};
use tokio_util::sync::CancellationToken as Signal;

/// Cancel signal bound to one job.
///
/// Checking is cooperative: orchestrations call [`checkpoint`] at iteration
/// boundaries (before each chapter, asset, or retry attempt). Work already
/// in flight is never interrupted, so cancellation latency is bounded by the
/// current sub-operation.
///
/// [`checkpoint`]: CancellationToken::checkpoint
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    signal: Signal,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled whenever `parent` is, e.g. on service shutdown.
    pub fn child_of(parent: &Signal) -> Self {
        Self {
            signal: parent.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.signal.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Returns `Err(ExportError::Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ExportError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the token is cancelled. Used to cut a backoff wait
    /// short, never to abort an issued request.
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }
}
