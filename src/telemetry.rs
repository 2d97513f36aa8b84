//! Structured logging and OpenTelemetry spans for the export worker.

use crate::job::{ExportJob, JobStatus};
use crate::snapshot::JobError;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TRACER_NAME: &str = "export-queue";

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` (default `info`). With `json` set, log
/// lines are emitted as JSON objects instead of the human-readable format.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .try_init()?;
    Ok(())
}

/// Records telemetry for a job that reached a terminal state.
///
/// Emits an `export_job` span and a structured log line. Jobs running longer
/// than `slow_after` additionally log a warning.
///
/// # Arguments
///
/// * `job` - The finished job
/// * `error` - Error block of a failed job, if any
/// * `slow_after` - Duration above which the job counts as slow
pub fn record_job_telemetry(job: &ExportJob, error: Option<&JobError>, slow_after: Duration) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("export_job");

    span.set_attribute(KeyValue::new("job_id", job.id.to_string()));
    span.set_attribute(KeyValue::new("target_id", job.target_id().to_string()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("formats", format_list(job)));
    span.set_attribute(KeyValue::new(
        "chapter_count",
        job.spec.chapter_selection.as_ref().map_or(0, Vec::len) as i64,
    ));

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.id,
            target_id = %job.target_id(),
            duration_ms = duration_ms,
            status = %job.status,
            "Export job finished"
        );

        let slow_ms = i64::try_from(slow_after.as_millis()).unwrap_or(i64::MAX);
        if duration_ms > slow_ms {
            warn!(
                job_id = %job.id,
                duration_ms = duration_ms,
                threshold_ms = slow_ms,
                "Export job exceeded duration threshold"
            );
        }
    }

    if job.status == JobStatus::Failed {
        if let Some(error) = error {
            span.set_attribute(KeyValue::new("error.code", error.code.clone()));
            span.set_attribute(KeyValue::new("error.message", error.message.clone()));
            warn!(
                job_id = %job.id,
                code = %error.code,
                error = %error.message,
                "Export job failed"
            );
        }
    }

    span.end();
}

/// Records a worker heartbeat after each job.
///
/// # Arguments
///
/// * `queue_length` - Jobs still waiting, excluding the active one
pub fn record_worker_heartbeat(queue_length: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("queue_length", queue_length as i64));
    span.end();

    info!(queue_length = queue_length, "Worker heartbeat");
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Called once at startup when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// # Arguments
///
/// * `endpoint` - Collector endpoint, e.g. `http://localhost:4317`
/// * `service_name` - Value of the `service.name` resource attribute
pub fn init_telemetry(endpoint: &str, service_name: &str) -> anyhow::Result<()> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name.to_string()),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    match tracer.provider() {
        Some(provider) => {
            global::set_tracer_provider(provider);
        }
        None => anyhow::bail!("OTLP pipeline returned a tracer without a provider"),
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

/// Flushes pending spans on shutdown.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

fn format_list(job: &ExportJob) -> String {
    job.spec
        .formats
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ExportRequest;

    fn job(formats: &[&str]) -> ExportJob {
        let spec = ExportRequest::new("book-1", formats)
            .validate(&std::env::temp_dir())
            .unwrap();
        ExportJob::new(spec)
    }

    #[test]
    fn test_record_job_telemetry() {
        let mut job = job(&["epub", "pdf"]);
        job.start();
        job.finish(JobStatus::Completed);

        // No provider installed; must not panic.
        record_job_telemetry(&job, None, Duration::from_secs(600));
        assert_eq!(format_list(&job), "epub,pdf");
    }

    #[test]
    fn test_record_failed_job() {
        let mut job = job(&["pdf"]);
        job.start();
        job.finish(JobStatus::Failed);

        let error = JobError {
            code: "network_error".to_string(),
            message: "connection reset".to_string(),
            details: None,
        };
        record_job_telemetry(&job, Some(&error), Duration::ZERO);
        record_worker_heartbeat(3);
    }
}
