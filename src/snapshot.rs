//! Immutable progress records broadcast after every job state change.

use crate::error::ExportError;
use crate::job::{ExportJob, Format, JobId, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Files produced by a finished export, keyed by format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<Format, Vec<PathBuf>>,
}

impl JobOutputs {
    pub fn with_file(mut self, format: Format, path: impl Into<PathBuf>) -> Self {
        self.files.entry(format).or_default().push(path.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Error block attached to a failed job's terminal snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&ExportError> for JobError {
    fn from(err: &ExportError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: err.details().cloned(),
        }
    }
}

/// Point-in-time progress of one job. Never mutated after publication;
/// newer state is a new `Snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub job_id: JobId,
    pub target_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<Format, Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    /// Blank snapshot for `job` in the given status.
    pub fn for_job(job: &ExportJob, status: JobStatus) -> Self {
        Self {
            job_id: job.id.clone(),
            target_id: job.target_id().to_string(),
            status,
            queue_position: None,
            percentage: 0,
            message: None,
            eta_seconds: None,
            current_chapter: None,
            total_chapters: None,
            chapter_title: None,
            title: None,
            outputs: BTreeMap::new(),
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Snapshot for a job waiting in the queue at its current position.
    pub fn queued(job: &ExportJob) -> Self {
        Self {
            queue_position: Some(job.queue_position),
            message: Some("Queued".to_string()),
            ..Self::for_job(job, JobStatus::Queued)
        }
    }

    /// Terminal snapshot for a job removed from the queue before it started.
    pub fn cancelled_before_start(job: &ExportJob) -> Self {
        Self {
            message: Some("Cancelled".to_string()),
            ..Self::for_job(job, JobStatus::Cancelled)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ExportRequest;
    use serde_json::json;

    fn job() -> ExportJob {
        let spec = ExportRequest::new("book-9", &["epub"])
            .validate(&std::env::temp_dir())
            .unwrap();
        ExportJob::new(spec)
    }

    #[test]
    fn test_queued_snapshot_serialization_omits_empty_fields() {
        let mut job = job();
        job.queue_position = 2;
        let value = serde_json::to_value(Snapshot::queued(&job)).unwrap();

        assert_eq!(value["status"], "queued");
        assert_eq!(value["queue_position"], 2);
        assert_eq!(value["target_id"], "book-9");
        assert!(value.get("outputs").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_outputs_serialize_by_format_name() {
        let outputs = JobOutputs::default()
            .with_title("Book")
            .with_file(Format::Epub, "book.epub")
            .with_file(Format::PdfChapters, "ch1.pdf")
            .with_file(Format::PdfChapters, "ch2.pdf");

        let mut snapshot = Snapshot::for_job(&job(), JobStatus::Completed);
        snapshot.outputs = outputs.files;
        let value = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(
            value["outputs"],
            json!({ "epub": ["book.epub"], "pdf-chapters": ["ch1.pdf", "ch2.pdf"] })
        );
    }

    #[test]
    fn test_job_error_from_export_error() {
        let err = JobError::from(&ExportError::Auth("session expired".into()));
        assert_eq!(err.code, "auth_error");
        assert_eq!(err.message, "authentication failed: session expired");
        assert!(err.details.is_none());
    }
}
