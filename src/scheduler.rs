//! The single worker loop.
//!
//! At most one job executes at a time. The worker claims the head of the
//! queue, drives it through the [`Orchestrator`], feeds every reported update
//! to the [`ProgressTracker`], finalizes the outcome, and moves on. Failures
//! and panics inside an orchestration end that job only.

use crate::error::ExportError;
use crate::job::{ExportJob, JobStatus};
use crate::orchestrator::{Orchestrator, ProgressReporter};
use crate::queue::{Claimed, JobQueue};
use crate::snapshot::JobError;
use crate::telemetry;
use crate::tracker::ProgressTracker;
use chrono::Utc;
use serde_json::{json, Value};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Knobs for the worker that do not affect job semantics.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Directory for per-failure trace files; `None` disables them.
    pub error_log_dir: Option<PathBuf>,
    /// Jobs running longer than this log a warning.
    pub slow_job_warn: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            error_log_dir: None,
            slow_job_warn: Duration::from_secs(600),
        }
    }
}

pub struct Scheduler {
    queue: Arc<JobQueue>,
    tracker: Arc<ProgressTracker>,
    orchestrator: Arc<dyn Orchestrator>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        tracker: Arc<ProgressTracker>,
        orchestrator: Arc<dyn Orchestrator>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            queue,
            tracker,
            orchestrator,
            settings,
        }
    }

    /// Runs until the queue is shut down. A job in flight at shutdown is
    /// cancelled through its token and finalized before the loop exits.
    pub async fn run(self) {
        info!("Worker started");

        loop {
            let claimed = tokio::select! {
                biased;
                _ = self.queue.closed() => break,
                claimed = self.queue.wait_next() => claimed,
            };

            self.process(claimed).await;
            telemetry::record_worker_heartbeat(self.queue.queue_length());
        }

        info!("Worker stopped");
    }

    /// Executes one claimed job through to its terminal snapshot and releases
    /// the active slot.
    pub async fn process(&self, claimed: Claimed) -> ExportJob {
        let Claimed { mut job, token, .. } = claimed;
        self.tracker.begin(&job);

        let (reporter, mut updates) = ProgressReporter::channel();
        let mut handle = {
            let orchestrator = Arc::clone(&self.orchestrator);
            let job = job.clone();
            let token = token.clone();
            tokio::spawn(async move { orchestrator.run(job, reporter, token).await })
        };

        let joined = loop {
            tokio::select! {
                biased;
                Some(update) = updates.recv() => {
                    self.tracker.apply(&job.id, update);
                }
                joined = &mut handle => break joined,
            }
        };
        // Reports sent right before the orchestration returned.
        while let Ok(update) = updates.try_recv() {
            self.tracker.apply(&job.id, update);
        }

        let outcome = joined.unwrap_or_else(|e| Err(join_failure(e)));
        let mut job_error = None;
        let status = match outcome {
            Ok(outputs) => {
                self.tracker.complete(&job.id, outputs);
                JobStatus::Completed
            }
            Err(err) if err.is_cancelled() || token.is_cancelled() => {
                if !err.is_cancelled() {
                    debug!(job_id = %job.id, error = %err, "Error after cancel request");
                }
                self.tracker.cancel(&job.id);
                JobStatus::Cancelled
            }
            Err(err) => {
                error!(job_id = %job.id, code = err.code(), error = %err, "Export failed");
                let mut block = JobError::from(&err);
                if let Some(dir) = &self.settings.error_log_dir {
                    match write_trace_file(dir, &job, &err).await {
                        Ok(path) => attach_trace_log(&mut block, &path),
                        Err(e) => warn!(job_id = %job.id, error = %e, "Failed to write error trace"),
                    }
                }
                self.tracker.fail(&job.id, block.clone());
                job_error = Some(block);
                JobStatus::Failed
            }
        };

        job.finish(status);
        self.queue.finish_active(&job.id);

        telemetry::record_job_telemetry(&job, job_error.as_ref(), self.settings.slow_job_warn);
        job
    }
}

fn join_failure(err: JoinError) -> ExportError {
    if err.is_panic() {
        let message = panic_message(err.into_panic());
        error!(panic = %message, "Export task panicked");
        ExportError::internal(format!("export task panicked: {message}"))
    } else {
        ExportError::internal(format!("export task aborted: {err}"))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn attach_trace_log(block: &mut JobError, path: &Path) {
    let trace_log = Value::String(path.display().to_string());
    let details = match block.details.take() {
        Some(Value::Object(mut map)) => {
            map.insert("trace_log".to_string(), trace_log);
            Value::Object(map)
        }
        Some(other) => json!({ "detail": other, "trace_log": trace_log }),
        None => json!({ "trace_log": trace_log }),
    };
    block.details = Some(details);
}

/// Writes `export-error-<id8>-<millis>.log` describing a failed job.
async fn write_trace_file(dir: &Path, job: &ExportJob, err: &ExportError) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let now = Utc::now();
    let path = dir.join(format!(
        "export-error-{}-{}.log",
        job.id.short(),
        now.timestamp_millis()
    ));
    let formats: Vec<&str> = job.spec.formats.iter().map(|f| f.as_str()).collect();
    let body = format!(
        "timestamp: {}\njob_id: {}\ntarget_id: {}\nformats: {}\nchapters: {:?}\noutput_dir: {}\ncode: {}\nerror: {}\ndetails: {}\n",
        now.to_rfc3339(),
        job.id,
        job.target_id(),
        formats.join(","),
        job.spec.chapter_selection,
        job.spec.output_directory.display(),
        err.code(),
        err,
        err.details().map(Value::to_string).unwrap_or_default(),
    );
    tokio::fs::write(&path, body).await?;
    Ok(path)
}
