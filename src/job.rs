//! Job models, the export format catalogue, and request validation.

use crate::error::{ExportError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Opaque unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used in log file names.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Output formats the exporter can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Format {
    #[serde(rename = "epub")]
    Epub,
    #[serde(rename = "pdf")]
    Pdf,
    #[serde(rename = "pdf-chapters")]
    PdfChapters,
}

impl Format {
    pub const ALL: [Format; 3] = [Format::Epub, Format::Pdf, Format::PdfChapters];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Epub => "epub",
            Format::Pdf => "pdf",
            Format::PdfChapters => "pdf-chapters",
        }
    }

    /// Book-only formats always render the whole document and cannot be
    /// combined with a chapter selection.
    pub fn is_book_only(&self) -> bool {
        matches!(self, Format::Epub)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Format::Epub => "Standard EPUB format (default)",
            Format::Pdf => "Single PDF file",
            Format::PdfChapters => "Separate PDF per chapter",
        }
    }

    /// Parses user input into an ordered, de-duplicated format list.
    ///
    /// Each entry may itself be a comma-separated list; the keyword `all`
    /// expands to EPUB plus PDF.
    pub fn parse_list<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<Format>> {
        let mut formats = Vec::new();
        let mut invalid = Vec::new();

        for raw in inputs
            .iter()
            .flat_map(|input| input.as_ref().split(','))
            .map(|part| part.trim().to_ascii_lowercase())
            .filter(|part| !part.is_empty())
        {
            let expanded: Vec<Format> = if raw == "all" {
                vec![Format::Epub, Format::Pdf]
            } else {
                match raw.parse::<Format>() {
                    Ok(format) => vec![format],
                    Err(_) => {
                        invalid.push(raw);
                        continue;
                    }
                }
            };
            for format in expanded {
                if !formats.contains(&format) {
                    formats.push(format);
                }
            }
        }

        if !invalid.is_empty() {
            let supported: Vec<&str> = Format::ALL.iter().map(Format::as_str).collect();
            return Err(ExportError::validation_with_details(
                "invalid_format",
                format!(
                    "Unsupported format(s): {}. Supported formats: {}",
                    invalid.join(", "),
                    supported.join(", ")
                ),
                json!({ "unsupported": invalid }),
            ));
        }

        if formats.is_empty() {
            return Err(ExportError::validation(
                "invalid_format",
                "At least one output format is required",
            ));
        }

        Ok(formats)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epub" => Ok(Format::Epub),
            "pdf" => Ok(Format::Pdf),
            "pdf-chapters" => Ok(Format::PdfChapters),
            other => Err(ExportError::validation(
                "invalid_format",
                format!("Unsupported format: {other}"),
            )),
        }
    }
}

/// Lifecycle status of a job.
///
/// `Queued` and the three terminal states are the only ones a job may stay
/// in indefinitely; the rest are phases the orchestration moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Starting,
    FetchingMetadata,
    FetchingChapters,
    DownloadingCover,
    ProcessingChapters,
    DownloadingAssets,
    GeneratingEpub,
    GeneratingPdf,
    GeneratingPdfChapters,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Starting => "starting",
            JobStatus::FetchingMetadata => "fetching_metadata",
            JobStatus::FetchingChapters => "fetching_chapters",
            JobStatus::DownloadingCover => "downloading_cover",
            JobStatus::ProcessingChapters => "processing_chapters",
            JobStatus::DownloadingAssets => "downloading_assets",
            JobStatus::GeneratingEpub => "generating_epub",
            JobStatus::GeneratingPdf => "generating_pdf",
            JobStatus::GeneratingPdfChapters => "generating_pdf_chapters",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    /// True for every state between leaving the queue and finishing.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != JobStatus::Queued
    }

    /// Position in the forward pipeline. The generating phases share a rank
    /// because multi-format jobs pass through several of them.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Starting => 1,
            JobStatus::FetchingMetadata => 2,
            JobStatus::FetchingChapters => 3,
            JobStatus::DownloadingCover => 4,
            JobStatus::ProcessingChapters => 5,
            JobStatus::DownloadingAssets => 6,
            JobStatus::GeneratingEpub
            | JobStatus::GeneratingPdf
            | JobStatus::GeneratingPdfChapters => 7,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed => 8,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw enqueue payload as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub formats: Option<FormatsInput>,
    #[serde(default)]
    pub chapters: Option<Vec<i64>>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub skip_images: bool,
}

/// Formats may be sent as a single (comma-separated) string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FormatsInput {
    One(String),
    Many(Vec<String>),
}

impl FormatsInput {
    fn entries(&self) -> Vec<&str> {
        match self {
            FormatsInput::One(s) => vec![s.as_str()],
            FormatsInput::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

impl ExportRequest {
    pub fn new(target_id: impl Into<String>, formats: &[&str]) -> Self {
        Self {
            target_id: Some(target_id.into()),
            formats: Some(FormatsInput::Many(
                formats.iter().map(|f| f.to_string()).collect(),
            )),
            ..Default::default()
        }
    }

    pub fn with_chapters(mut self, chapters: Vec<i64>) -> Self {
        self.chapters = Some(chapters);
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_skip_images(mut self, skip: bool) -> Self {
        self.skip_images = skip;
        self
    }

    /// Checks the request shape and produces the immutable job parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Validation`] for a missing target, an empty or
    /// unknown format list, chapter indices below 1, a chapter selection
    /// combined with a book-only format, or an output path that is a file.
    pub fn validate(self, default_output_dir: &Path) -> Result<JobSpec> {
        let target_id = self
            .target_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ExportError::validation("target_id_required", "target_id required"))?
            .to_string();

        let formats = match &self.formats {
            Some(input) => Format::parse_list(&input.entries())?,
            None => {
                return Err(ExportError::validation(
                    "invalid_format",
                    "At least one output format is required",
                ))
            }
        };

        let chapter_selection = match self.chapters {
            None => None,
            Some(chapters) if chapters.is_empty() => None,
            Some(chapters) => {
                let mut selected = Vec::with_capacity(chapters.len());
                let mut invalid = Vec::new();
                for chapter in chapters {
                    match u32::try_from(chapter) {
                        Ok(index) if index >= 1 => selected.push(index),
                        _ => invalid.push(chapter),
                    }
                }
                if !invalid.is_empty() {
                    return Err(ExportError::validation_with_details(
                        "invalid_chapters",
                        format!(
                            "Chapter indices must be between 1 and {}: {invalid:?}",
                            u32::MAX
                        ),
                        json!({ "invalid": invalid }),
                    ));
                }
                selected.sort_unstable();
                selected.dedup();
                Some(selected)
            }
        };

        if chapter_selection.is_some() {
            let unsupported: Vec<&str> = formats
                .iter()
                .filter(|f| f.is_book_only())
                .map(Format::as_str)
                .collect();
            if !unsupported.is_empty() {
                return Err(ExportError::validation_with_details(
                    "chapters_not_supported_for_format",
                    format!(
                        "Chapter selection not supported for: {}. Remove 'chapters' or use chapter-compatible formats.",
                        unsupported.join(", ")
                    ),
                    json!({ "unsupported_formats": unsupported }),
                ));
            }
        }

        let output_directory = self
            .output_dir
            .unwrap_or_else(|| default_output_dir.to_path_buf());
        if output_directory.exists() && !output_directory.is_dir() {
            return Err(ExportError::validation(
                "invalid_output_dir",
                format!("{} is not a directory", output_directory.display()),
            ));
        }

        Ok(JobSpec {
            target_id,
            formats,
            chapter_selection,
            output_directory,
            skip_images: self.skip_images,
        })
    }
}

/// Validated, immutable job parameters handed to the orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub target_id: String,
    pub formats: Vec<Format>,
    pub chapter_selection: Option<Vec<u32>>,
    pub output_directory: PathBuf,
    pub skip_images: bool,
}

/// One export request from admission to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: JobId,
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub queue_position: usize,
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: JobId::generate(),
            spec,
            created_at: Utc::now(),
            status: JobStatus::Queued,
            queue_position: 0,
            cancel_requested: false,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.spec.target_id
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Starting;
        self.queue_position = 0;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock time between start and finish, once the job is terminal.
    pub fn processing_duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn out() -> PathBuf {
        std::env::temp_dir()
    }

    #[test]
    fn test_parse_formats_dedupes_and_expands_all() {
        let formats = Format::parse_list(&["pdf, epub", "all", "PDF-chapters"]).unwrap();
        assert_eq!(formats, vec![Format::Pdf, Format::Epub, Format::PdfChapters]);
    }

    #[test]
    fn test_parse_formats_rejects_unknown() {
        let err = Format::parse_list(&["epub", "docx"]).unwrap_err();
        assert_eq!(err.code(), "invalid_format");
        assert_eq!(err.details(), Some(&json!({ "unsupported": ["docx"] })));
    }

    #[test]
    fn test_empty_formats_rejected() {
        let err = ExportRequest::new("book-1", &[]).validate(&out()).unwrap_err();
        assert_eq!(err.code(), "invalid_format");

        let err = ExportRequest::new("book-1", &[" , "]).validate(&out()).unwrap_err();
        assert_eq!(err.code(), "invalid_format");
    }

    #[test]
    fn test_missing_target_rejected() {
        let err = ExportRequest::new("  ", &["epub"]).validate(&out()).unwrap_err();
        assert_eq!(err.code(), "target_id_required");
    }

    #[test]
    fn test_chapter_indices_must_be_positive() {
        let err = ExportRequest::new("book-1", &["pdf"])
            .with_chapters(vec![1, 0, -2])
            .validate(&out())
            .unwrap_err();
        assert_eq!(err.code(), "invalid_chapters");
    }

    #[test]
    fn test_chapter_indices_beyond_u32_rejected() {
        let err = ExportRequest::new("book-1", &["pdf"])
            .with_chapters(vec![2, 5_000_000_000, 6_000_000_000])
            .validate(&out())
            .unwrap_err();
        assert_eq!(err.code(), "invalid_chapters");
        assert_eq!(
            err.details(),
            Some(&json!({ "invalid": [5_000_000_000_i64, 6_000_000_000_i64] }))
        );
    }

    #[test]
    fn test_book_only_format_rejects_chapter_selection() {
        let err = ExportRequest::new("book-1", &["epub", "pdf"])
            .with_chapters(vec![2])
            .validate(&out())
            .unwrap_err();
        assert_eq!(err.code(), "chapters_not_supported_for_format");
        assert_eq!(
            err.details(),
            Some(&json!({ "unsupported_formats": ["epub"] }))
        );
    }

    #[test]
    fn test_chapter_selection_normalized() {
        let spec = ExportRequest::new("book-1", &["pdf-chapters"])
            .with_chapters(vec![3, 1, 3])
            .validate(&out())
            .unwrap();
        assert_eq!(spec.chapter_selection, Some(vec![1, 3]));

        let spec = ExportRequest::new("book-1", &["epub"])
            .with_chapters(vec![])
            .validate(&out())
            .unwrap();
        assert_eq!(spec.chapter_selection, None);
    }

    #[test]
    fn test_output_dir_must_not_be_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = ExportRequest::new("book-1", &["epub"])
            .with_output_dir(file.path())
            .validate(&out())
            .unwrap_err();
        assert_eq!(err.code(), "invalid_output_dir");
    }

    #[test]
    fn test_default_output_dir_applied() {
        let spec = ExportRequest::new("book-1", &["epub"])
            .validate(Path::new("/srv/exports"))
            .unwrap();
        assert_eq!(spec.output_directory, PathBuf::from("/srv/exports"));
        assert!(!spec.skip_images);
    }

    #[test]
    fn test_job_state_transitions() {
        let spec = ExportRequest::new("book-1", &["epub"]).validate(&out()).unwrap();
        let mut job = ExportJob::new(spec);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.processing_duration_ms().is_none());

        job.start();
        assert!(job.status.is_active());

        job.finish(JobStatus::Completed);
        assert!(job.status.is_terminal());
        assert!(job.processing_duration_ms().is_some());
    }

    #[test]
    fn test_status_ranks_move_forward() {
        assert!(JobStatus::Starting.rank() < JobStatus::FetchingMetadata.rank());
        assert!(JobStatus::ProcessingChapters.rank() < JobStatus::DownloadingAssets.rank());
        assert_eq!(JobStatus::GeneratingEpub.rank(), JobStatus::GeneratingPdf.rank());
        assert_eq!(JobStatus::GeneratingPdfChapters.to_string(), "generating_pdf_chapters");
    }
}
