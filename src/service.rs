//! The explicit service instance shared by every request handler.

use crate::broadcast::{ProgressBroadcaster, Subscription, SubscriptionTarget};
use crate::error::Result;
use crate::job::{ExportRequest, JobId};
use crate::orchestrator::Orchestrator;
use crate::queue::{CancelOutcome, Enqueued, JobQueue, QueueView};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::snapshot::Snapshot;
use crate::tracker::ProgressTracker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Acknowledgement of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelAck {
    pub job_id: JobId,
    pub message: String,
}

/// Owns the queue, the tracker, and the broadcaster of one process.
///
/// Handlers call into this; the worker is started with
/// [`spawn_worker`](ExportService::spawn_worker).
#[derive(Debug, Clone)]
pub struct ExportService {
    queue: Arc<JobQueue>,
    tracker: Arc<ProgressTracker>,
    broadcaster: ProgressBroadcaster,
    default_output_dir: PathBuf,
}

impl ExportService {
    pub fn new(broadcaster: ProgressBroadcaster, default_output_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue: Arc::new(JobQueue::new(broadcaster.clone())),
            tracker: Arc::new(ProgressTracker::new(broadcaster.clone())),
            broadcaster,
            default_output_dir: default_output_dir.into(),
        }
    }

    /// Validates `request` and appends it to the queue.
    ///
    /// # Errors
    ///
    /// Returns a validation error without creating a job when the request
    /// is malformed.
    pub fn enqueue(&self, request: ExportRequest) -> Result<Enqueued> {
        let spec = request.validate(&self.default_output_dir)?;
        Ok(self.queue.enqueue(spec))
    }

    /// Cancels the given job, or the active job when `job_id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::NotFound`](crate::error::ExportError::NotFound)
    /// when no queued or active job matches.
    pub fn cancel(&self, job_id: Option<&JobId>) -> Result<CancelAck> {
        match self.queue.cancel(job_id)? {
            CancelOutcome::Removed { job, .. } => Ok(CancelAck {
                message: format!("Removed queued job {}", job.id),
                job_id: job.id,
            }),
            CancelOutcome::Requested {
                job_id,
                already_requested,
            } => {
                if !already_requested {
                    self.tracker.note_cancel_requested(&job_id);
                }
                info!(job_id = %job_id, "Cancellation requested");
                Ok(CancelAck {
                    message: "Cancellation requested".to_string(),
                    job_id,
                })
            }
        }
    }

    /// Latest snapshot for a job, or for the most recently active job.
    pub fn poll(&self, job_id: Option<&JobId>) -> Option<Arc<Snapshot>> {
        self.broadcaster.poll(job_id)
    }

    pub fn subscribe(&self, job_id: Option<JobId>) -> Subscription {
        self.broadcaster.subscribe(SubscriptionTarget::from(job_id))
    }

    pub fn queue_view(&self) -> QueueView {
        self.queue.view()
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.broadcaster
    }

    pub fn default_output_dir(&self) -> &Path {
        &self.default_output_dir
    }

    /// Builds the worker for this service.
    pub fn scheduler(
        &self,
        orchestrator: Arc<dyn Orchestrator>,
        settings: SchedulerSettings,
    ) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.tracker),
            orchestrator,
            settings,
        )
    }

    pub fn spawn_worker(
        &self,
        orchestrator: Arc<dyn Orchestrator>,
        settings: SchedulerSettings,
    ) -> JoinHandle<()> {
        tokio::spawn(self.scheduler(orchestrator, settings).run())
    }

    /// Stops the worker after cancelling the job in flight.
    pub fn shutdown(&self) {
        info!("Shutting down export service");
        self.queue.shutdown();
    }

    /// Ends client streams (`Latest` and `Job` subscribers) so the HTTP
    /// server can drain. `All` subscribers keep receiving until
    /// [`close_subscriptions`](ExportService::close_subscriptions).
    pub fn close_streams(&self) {
        self.broadcaster
            .close_where(|target| *target != SubscriptionTarget::All);
    }

    /// Ends every live subscription once no further snapshots will come.
    pub fn close_subscriptions(&self) {
        self.broadcaster.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;
    use crate::job::JobStatus;
    use pretty_assertions::assert_eq;

    fn service() -> ExportService {
        ExportService::new(ProgressBroadcaster::default(), std::env::temp_dir())
    }

    #[test]
    fn test_invalid_request_creates_no_job() {
        let service = service();
        let err = service
            .enqueue(ExportRequest::new("book", &["epub"]).with_chapters(vec![1, 2]))
            .unwrap_err();
        assert_eq!(err.code(), "chapters_not_supported_for_format");
        assert!(service.queue_view().pending.is_empty());
        assert!(service.poll(None).is_none());
    }

    #[test]
    fn test_enqueue_makes_job_pollable() {
        let service = service();
        let enqueued = service
            .enqueue(ExportRequest::new("book", &["pdf"]))
            .unwrap();
        assert_eq!(enqueued.queue_position, 0);

        let snapshot = service.poll(Some(&enqueued.job.id)).unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.queue_position, Some(0));
    }

    #[test]
    fn test_cancel_without_active_job_is_not_found() {
        let service = service();
        service.enqueue(ExportRequest::new("book", &["pdf"])).unwrap();
        assert!(matches!(service.cancel(None), Err(ExportError::NotFound(_))));
    }

    #[test]
    fn test_cancel_queued_job() {
        let service = service();
        let job = service
            .enqueue(ExportRequest::new("book", &["pdf"]))
            .unwrap()
            .job;

        let ack = service.cancel(Some(&job.id)).unwrap();
        assert_eq!(ack.job_id, job.id);
        assert_eq!(service.poll(Some(&job.id)).unwrap().status, JobStatus::Cancelled);
        assert!(matches!(
            service.cancel(Some(&job.id)),
            Err(ExportError::NotFound(_))
        ));
    }
}
