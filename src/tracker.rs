//! State machine for the active job's progress.

use crate::broadcast::ProgressBroadcaster;
use crate::job::{ExportJob, JobId, JobStatus};
use crate::snapshot::{JobError, JobOutputs, Snapshot};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// A progress report emitted by the orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub status: JobStatus,
    #[serde(default)]
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chapter: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chapters: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_title: Option<String>,
}

impl ProgressUpdate {
    pub fn new(status: JobStatus, percentage: u8) -> Self {
        Self {
            status,
            percentage,
            message: None,
            eta_seconds: None,
            current_chapter: None,
            total_chapters: None,
            chapter_title: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_eta(mut self, seconds: u64) -> Self {
        self.eta_seconds = Some(seconds);
        self
    }

    /// Chapter counters; zero values are treated as unknown.
    pub fn with_chapter(mut self, current: u32, total: u32, title: impl Into<String>) -> Self {
        self.current_chapter = (current > 0).then_some(current);
        self.total_chapters = (total > 0).then_some(total);
        let title = title.into();
        self.chapter_title = (!title.is_empty()).then_some(title);
        self
    }
}

#[derive(Debug)]
struct Tracked {
    job_id: JobId,
    snapshot: Arc<Snapshot>,
}

/// Owns the authoritative snapshot of the job currently being executed and
/// publishes every accepted change to the broadcaster.
///
/// Rules:
/// - percentage never decreases within a job; it resets when a new job begins
/// - phases only move forward through the pipeline
/// - once terminal, a job's snapshot is frozen
#[derive(Debug)]
pub struct ProgressTracker {
    broadcaster: ProgressBroadcaster,
    current: Mutex<Option<Tracked>>,
}

impl ProgressTracker {
    pub fn new(broadcaster: ProgressBroadcaster) -> Self {
        Self {
            broadcaster,
            current: Mutex::new(None),
        }
    }

    /// Starts tracking `job`, replacing whatever was tracked before.
    pub fn begin(&self, job: &ExportJob) -> Arc<Snapshot> {
        let snapshot = Snapshot {
            queue_position: Some(0),
            message: Some("Starting".to_string()),
            ..Snapshot::for_job(job, JobStatus::Starting)
        };

        let mut current = self.lock();
        let snapshot = self.broadcaster.publish(snapshot);
        *current = Some(Tracked {
            job_id: job.id.clone(),
            snapshot: Arc::clone(&snapshot),
        });
        info!(job_id = %job.id, target_id = %job.target_id(), "Job started");
        snapshot
    }

    /// Applies an orchestration report. Returns the published snapshot, or
    /// `None` when the report was rejected.
    pub fn apply(&self, job_id: &JobId, update: ProgressUpdate) -> Option<Arc<Snapshot>> {
        let mut current = self.lock();
        let tracked = match current.as_mut() {
            Some(tracked) if tracked.job_id == *job_id => tracked,
            _ => {
                warn!(job_id = %job_id, status = %update.status, "Ignoring progress for untracked job");
                return None;
            }
        };

        let previous = &tracked.snapshot;
        if previous.is_terminal() {
            warn!(
                job_id = %job_id,
                status = %update.status,
                terminal = %previous.status,
                "Ignoring progress after terminal state"
            );
            return None;
        }
        if !update.status.is_active() {
            warn!(job_id = %job_id, status = %update.status, "Orchestration may not report this status");
            return None;
        }
        if update.status.rank() < previous.status.rank() {
            warn!(
                job_id = %job_id,
                from = %previous.status,
                to = %update.status,
                "Ignoring phase regression"
            );
            return None;
        }

        let percentage = update.percentage.min(100).max(previous.percentage);
        let next = Snapshot {
            status: update.status,
            queue_position: Some(0),
            percentage,
            message: update.message,
            eta_seconds: update.eta_seconds,
            current_chapter: update.current_chapter,
            total_chapters: update.total_chapters,
            chapter_title: update.chapter_title,
            updated_at: Utc::now(),
            ..(**previous).clone()
        };

        debug!(job_id = %job_id, status = %next.status, percentage, "Progress");
        let published = self.broadcaster.publish(next);
        tracked.snapshot = Arc::clone(&published);
        Some(published)
    }

    /// Republishes the current state with a "Cancel requested" message.
    pub fn note_cancel_requested(&self, job_id: &JobId) -> Option<Arc<Snapshot>> {
        self.update_tracked(job_id, |previous| Snapshot {
            message: Some("Cancel requested".to_string()),
            updated_at: Utc::now(),
            ..previous.clone()
        })
    }

    pub fn complete(&self, job_id: &JobId, outputs: JobOutputs) -> Option<Arc<Snapshot>> {
        self.finish(job_id, |previous| Snapshot {
            status: JobStatus::Completed,
            percentage: 100,
            message: Some("Completed".to_string()),
            title: outputs.title.or_else(|| previous.title.clone()),
            outputs: outputs.files,
            ..terminal_base(previous)
        })
    }

    pub fn cancel(&self, job_id: &JobId) -> Option<Arc<Snapshot>> {
        self.finish(job_id, |previous| Snapshot {
            status: JobStatus::Cancelled,
            message: Some("Cancelled".to_string()),
            ..terminal_base(previous)
        })
    }

    pub fn fail(&self, job_id: &JobId, error: JobError) -> Option<Arc<Snapshot>> {
        self.finish(job_id, |previous| Snapshot {
            status: JobStatus::Failed,
            message: None,
            error: Some(error),
            ..terminal_base(previous)
        })
    }

    /// The tracked job's latest snapshot.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.lock().as_ref().map(|t| Arc::clone(&t.snapshot))
    }

    fn finish<F>(&self, job_id: &JobId, build: F) -> Option<Arc<Snapshot>>
    where
        F: FnOnce(&Snapshot) -> Snapshot,
    {
        let published = self.update_tracked(job_id, build)?;
        info!(job_id = %job_id, status = %published.status, "Job finished");
        Some(published)
    }

    fn update_tracked<F>(&self, job_id: &JobId, build: F) -> Option<Arc<Snapshot>>
    where
        F: FnOnce(&Snapshot) -> Snapshot,
    {
        let mut current = self.lock();
        let tracked = current.as_mut().filter(|t| t.job_id == *job_id)?;
        if tracked.snapshot.is_terminal() {
            warn!(job_id = %job_id, status = %tracked.snapshot.status, "Job already terminal");
            return None;
        }
        let published = self.broadcaster.publish(build(&tracked.snapshot));
        tracked.snapshot = Arc::clone(&published);
        Some(published)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Tracked>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn terminal_base(previous: &Snapshot) -> Snapshot {
    Snapshot {
        queue_position: None,
        eta_seconds: None,
        updated_at: Utc::now(),
        ..previous.clone()
    }
}
