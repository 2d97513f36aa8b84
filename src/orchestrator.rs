//! Seam between the scheduler and the subsystem that performs an export.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::job::ExportJob;
use crate::snapshot::JobOutputs;
use crate::tracker::ProgressUpdate;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Runs one export job to completion.
///
/// Implementations push progress through `progress`, call
/// [`CancellationToken::checkpoint`] at iteration boundaries, and return
/// `Err(ExportError::Cancelled)` once a checkpoint trips.
///
/// [`CancellationToken::checkpoint`]: crate::cancel::CancellationToken::checkpoint
#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    async fn run(
        &self,
        job: ExportJob,
        progress: ProgressReporter,
        token: CancellationToken,
    ) -> Result<JobOutputs>;
}

/// Sending half of the progress channel handed to an orchestration.
///
/// Reports never block; the orchestration never sees broadcaster state.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues an update for the tracker. Returns `false` once the worker
    /// stopped listening, which only happens after the job was finalized.
    pub fn report(&self, update: ProgressUpdate) -> bool {
        self.tx.send(update).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    #[test]
    fn test_report_after_receiver_dropped() {
        let (reporter, mut rx) = ProgressReporter::channel();
        assert!(reporter.report(ProgressUpdate::new(JobStatus::FetchingMetadata, 5)));
        assert_eq!(rx.try_recv().unwrap().percentage, 5);

        drop(rx);
        assert!(!reporter.report(ProgressUpdate::new(JobStatus::FetchingChapters, 10)));
    }
}
