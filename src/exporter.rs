//! Orchestrator that drives an external exporter process.
//!
//! The exporter is spawned once per job and speaks a JSON-lines protocol on
//! stdout:
//!
//! ```text
//! {"type":"progress","status":"fetching_chapters","percentage":10}
//! {"type":"result","title":"Some Book","files":{"epub":["/out/book.epub"]}}
//! {"type":"error","code":"auth_error","message":"session expired"}
//! ```
//!
//! Every line boundary is a cancellation checkpoint. When a job is
//! cancelled the exporter receives `{"type":"cancel"}` on stdin, which then
//! closes; the current sub-operation is allowed to finish and the process is
//! stopped at its next output line, or once it exits on its own.

use crate::cancel::CancellationToken;
use crate::error::{ExportError, Result};
use crate::job::ExportJob;
use crate::orchestrator::{Orchestrator, ProgressReporter};
use crate::retry::RetryPolicy;
use crate::snapshot::JobOutputs;
use crate::tracker::ProgressUpdate;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// Sent on the exporter's stdin when its job is cancelled.
const CANCEL_LINE: &[u8] = b"{\"type\":\"cancel\"}\n";

/// Lines of stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ExporterMessage {
    Progress(ProgressUpdate),
    Result(JobOutputs),
    Error { code: String, message: String },
}

/// Runs `program [args..] --target <id> --output-dir <dir> --format <f>...`
/// for every job.
#[derive(Debug, Clone)]
pub struct CommandOrchestrator {
    program: PathBuf,
    args: Vec<OsString>,
    retry: Option<RetryPolicy>,
}

impl CommandOrchestrator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            retry: None,
        }
    }

    /// Request retry budget forwarded as `--retries` and `--retry-backoff-ms`.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Fixed arguments placed before the per-job ones.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Per-job command-line arguments.
    pub fn job_args(&self, job: &ExportJob) -> Vec<OsString> {
        let spec = &job.spec;
        let mut args: Vec<OsString> = vec![
            "--target".into(),
            spec.target_id.clone().into(),
            "--output-dir".into(),
            spec.output_directory.clone().into_os_string(),
        ];
        for format in &spec.formats {
            args.push("--format".into());
            args.push(format.as_str().into());
        }
        if let Some(chapters) = &spec.chapter_selection {
            let list: Vec<String> = chapters.iter().map(u32::to_string).collect();
            args.push("--chapters".into());
            args.push(list.join(",").into());
        }
        if spec.skip_images {
            args.push("--skip-images".into());
        }
        if let Some(policy) = &self.retry {
            args.push("--retries".into());
            args.push(policy.max_attempts.saturating_sub(1).to_string().into());
            args.push("--retry-backoff-ms".into());
            args.push(policy.backoff.as_millis().to_string().into());
        }
        args
    }

    fn spawn(&self, job: &ExportJob) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .args(self.job_args(job))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExportError::internal(format!(
                    "failed to start exporter {}: {e}",
                    self.program.display()
                ))
            })
    }
}

#[async_trait]
impl Orchestrator for CommandOrchestrator {
    async fn run(
        &self,
        job: ExportJob,
        progress: ProgressReporter,
        token: CancellationToken,
    ) -> Result<JobOutputs> {
        token.checkpoint()?;

        let mut child = self.spawn(&job)?;
        info!(job_id = %job.id, pid = ?child.id(), "Exporter started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExportError::internal("exporter stdout unavailable"))?;
        let stderr_tail = child.stderr.take().map(|stderr| tokio::spawn(tail(stderr)));
        let mut stdin = child.stdin.take();

        let mut lines = BufReader::new(stdout).lines();
        let mut outputs = None;
        let mut reported_error = None;

        loop {
            let line = tokio::select! {
                biased;
                _ = token.cancelled(), if stdin.is_some() => {
                    request_cancel(&mut stdin, &job).await;
                    continue;
                }
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    stop(&mut child, &job).await;
                    return Err(ExportError::internal(format!("failed to read exporter output: {e}")));
                }
            };

            if let Err(e) = token.checkpoint() {
                stop(&mut child, &job).await;
                return Err(e);
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ExporterMessage>(line) {
                Ok(ExporterMessage::Progress(update)) => {
                    progress.report(update);
                }
                Ok(ExporterMessage::Result(result)) => outputs = Some(result),
                Ok(ExporterMessage::Error { code, message }) => {
                    reported_error = Some(map_error(&code, message));
                }
                Err(e) => {
                    debug!(job_id = %job.id, error = %e, "Ignoring unparseable exporter line: {}", line);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExportError::internal(format!("failed to wait for exporter: {e}")))?;

        if let Some(err) = reported_error {
            return Err(err);
        }
        if token.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        match outputs {
            Some(outputs) if status.success() => Ok(outputs),
            _ => {
                let stderr = match stderr_tail {
                    Some(handle) => handle.await.unwrap_or_default(),
                    None => String::new(),
                };
                let mut message = if status.success() {
                    "exporter exited without a result".to_string()
                } else {
                    format!("exporter exited with {status}")
                };
                if !stderr.is_empty() {
                    message.push_str(": ");
                    message.push_str(&stderr);
                }
                Err(ExportError::Internal(message))
            }
        }
    }
}

/// Stand-in used when no exporter program is configured; every job fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct MissingExporter;

#[async_trait]
impl Orchestrator for MissingExporter {
    async fn run(
        &self,
        job: ExportJob,
        _progress: ProgressReporter,
        token: CancellationToken,
    ) -> Result<JobOutputs> {
        token.checkpoint()?;
        warn!(job_id = %job.id, "No exporter configured");
        Err(ExportError::internal("no exporter configured; set EXPORT_COMMAND"))
    }
}

fn map_error(code: &str, message: String) -> ExportError {
    match code {
        "auth_error" => ExportError::Auth(message),
        "network_error" => ExportError::Network(message),
        "export_cancelled" => ExportError::Cancelled,
        _ => ExportError::Internal(message),
    }
}

/// Asks the exporter to wind down, then closes its stdin.
async fn request_cancel(stdin: &mut Option<ChildStdin>, job: &ExportJob) {
    if let Some(mut pipe) = stdin.take() {
        if let Err(e) = pipe.write_all(CANCEL_LINE).await {
            debug!(job_id = %job.id, error = %e, "Exporter did not accept cancel request");
        }
    }
    info!(job_id = %job.id, "Cancel sent to exporter; waiting for its next checkpoint");
}

async fn stop(child: &mut Child, job: &ExportJob) {
    if let Err(e) = child.kill().await {
        warn!(job_id = %job.id, error = %e, "Failed to stop exporter");
    } else {
        info!(job_id = %job.id, "Exporter stopped after cancellation");
    }
}

/// Collects the last few stderr lines.
async fn tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut kept = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if kept.len() == STDERR_TAIL_LINES {
            kept.pop_front();
        }
        kept.push_back(line);
    }
    Vec::from(kept).join("\n")
}
