//! In-memory job queue: pending FIFO plus the single active slot.

use crate::broadcast::ProgressBroadcaster;
use crate::cancel::CancellationToken;
use crate::error::{ExportError, Result};
use crate::job::{ExportJob, JobId, JobSpec, JobStatus};
use crate::snapshot::Snapshot;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken as Signal;
use tracing::{debug, info};

/// Result of admitting a job.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub job: ExportJob,
    pub queue_position: usize,
}

/// Result of a cancel request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The job had not started and was removed. `shifted` holds every later
    /// job with its new position.
    Removed { job: ExportJob, shifted: Vec<ExportJob> },
    /// The job is active; its token was signalled and the worker finalizes
    /// it at the next checkpoint.
    Requested { job_id: JobId, already_requested: bool },
}

/// A job handed to the worker.
#[derive(Debug)]
pub struct Claimed {
    pub job: ExportJob,
    pub token: CancellationToken,
    /// Pending jobs whose position changed because of the claim.
    pub shifted: Vec<ExportJob>,
}

#[derive(Debug)]
struct ActiveJob {
    job: ExportJob,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<ExportJob>,
    active: Option<ActiveJob>,
}

impl QueueState {
    /// Position of the pending job at `index`; the active job holds 0.
    fn position_of(&self, index: usize) -> usize {
        index + usize::from(self.active.is_some())
    }

    /// Recomputes stored positions, returning the jobs that moved.
    fn reposition(&mut self) -> Vec<ExportJob> {
        let offset = usize::from(self.active.is_some());
        let mut shifted = Vec::new();
        for (index, job) in self.pending.iter_mut().enumerate() {
            let position = index + offset;
            if job.queue_position != position {
                job.queue_position = position;
                shifted.push(job.clone());
            }
        }
        shifted
    }
}

/// Introspection view of the queue.
#[derive(Debug, Clone)]
pub struct QueueView {
    pub active: Option<ExportJob>,
    pub pending: Vec<ExportJob>,
}

/// Ordered pending jobs plus the single active slot.
///
/// All mutations happen under one lock. Positions are recomputed on every
/// change, which is linear in the pending count. Snapshots of pending jobs
/// (`queued`, or `cancelled` for removed ones) are published while the lock
/// is held, so none can land after the worker has claimed the job.
#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    wake: Notify,
    broadcaster: ProgressBroadcaster,
    /// Parent of every job token; cancelled on shutdown.
    shutdown: Signal,
}

impl JobQueue {
    pub fn new(broadcaster: ProgressBroadcaster) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            broadcaster,
            shutdown: Signal::new(),
        }
    }

    /// Appends a validated job and wakes the worker.
    ///
    /// The position is the number of jobs ahead of it, counting the active
    /// job as position 0.
    pub fn enqueue(&self, spec: JobSpec) -> Enqueued {
        let mut job = ExportJob::new(spec);
        let position = {
            let mut state = self.lock();
            let position = state.position_of(state.pending.len());
            job.queue_position = position;
            state.pending.push_back(job.clone());
            self.broadcaster.publish(Snapshot::queued(&job));
            position
        };
        self.wake.notify_one();

        info!(
            "Enqueued job: job_id={}, target_id={}, position={}",
            job.id,
            job.target_id(),
            position
        );
        Enqueued {
            job,
            queue_position: position,
        }
    }

    /// Cancels a pending job immediately, or flags the active one.
    ///
    /// With `job_id` omitted the active job is targeted.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::NotFound`] if no pending or active job matches.
    pub fn cancel(&self, job_id: Option<&JobId>) -> Result<CancelOutcome> {
        let mut state = self.lock();

        let target = match job_id {
            Some(id) => id.clone(),
            None => match &state.active {
                Some(active) => active.job.id.clone(),
                None => return Err(ExportError::NotFound("No active export".to_string())),
            },
        };

        if let Some(active) = state.active.as_mut().filter(|a| a.job.id == target) {
            let already_requested = active.job.cancel_requested;
            active.job.cancel_requested = true;
            active.token.cancel();
            info!(job_id = %target, already_requested, "Cancel requested for active job");
            return Ok(CancelOutcome::Requested {
                job_id: target,
                already_requested,
            });
        }

        let index = state
            .pending
            .iter()
            .position(|job| job.id == target)
            .ok_or_else(|| ExportError::NotFound(format!("Job {target} not found")))?;

        let mut job = state
            .pending
            .remove(index)
            .ok_or_else(|| ExportError::internal("pending index out of range"))?;
        job.cancel_requested = true;
        job.finish(JobStatus::Cancelled);
        self.broadcaster.publish(Snapshot::cancelled_before_start(&job));
        let shifted = state.reposition();
        self.publish_positions(&shifted);

        info!(job_id = %target, shifted = shifted.len(), "Removed queued job");
        Ok(CancelOutcome::Removed { job, shifted })
    }

    /// Pops the head of the pending sequence into the active slot.
    ///
    /// Returns `None` when nothing is pending or a job is already active.
    pub fn next(&self) -> Option<Claimed> {
        let mut state = self.lock();
        if state.active.is_some() {
            return None;
        }
        let mut job = state.pending.pop_front()?;
        job.start();
        let token = CancellationToken::child_of(&self.shutdown);
        state.active = Some(ActiveJob {
            job: job.clone(),
            token: token.clone(),
        });
        let shifted = state.reposition();
        self.publish_positions(&shifted);

        debug!("Claimed job: job_id={}", job.id);
        Some(Claimed { job, token, shifted })
    }

    /// Like [`next`](JobQueue::next), but waits until a job is available.
    pub async fn wait_next(&self) -> Claimed {
        loop {
            if let Some(claimed) = self.next() {
                return claimed;
            }
            self.wake.notified().await;
        }
    }

    /// Cancels the active job and every job claimed afterwards.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.wake.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`shutdown`](JobQueue::shutdown) was called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Releases the active slot once its job reached a terminal state.
    /// Returns pending jobs whose position changed.
    pub fn finish_active(&self, job_id: &JobId) -> Vec<ExportJob> {
        let mut state = self.lock();
        match &state.active {
            Some(active) if active.job.id == *job_id => {
                state.active = None;
            }
            _ => return Vec::new(),
        }
        let shifted = state.reposition();
        self.publish_positions(&shifted);
        drop(state);

        // A pending job may already be waiting for the slot.
        self.wake.notify_one();
        shifted
    }

    pub fn is_cancel_requested(&self, job_id: &JobId) -> bool {
        self.lock()
            .active
            .as_ref()
            .is_some_and(|a| a.job.id == *job_id && a.job.cancel_requested)
    }

    pub fn active_job_id(&self) -> Option<JobId> {
        self.lock().active.as_ref().map(|a| a.job.id.clone())
    }

    /// Returns the current queue length, excluding the active job.
    pub fn queue_length(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn view(&self) -> QueueView {
        let state = self.lock();
        QueueView {
            active: state.active.as_ref().map(|a| a.job.clone()),
            pending: state.pending.iter().cloned().collect(),
        }
    }

    /// Republishes a `queued` snapshot for every job whose position moved.
    fn publish_positions(&self, shifted: &[ExportJob]) {
        for job in shifted {
            self.broadcaster.publish(Snapshot::queued(job));
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
