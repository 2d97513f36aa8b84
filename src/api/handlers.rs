//! Route handlers.
//!
//! Polling and streaming both read through the same service API; neither
//! keeps state of its own.

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::job::{ExportJob, ExportRequest, Format, JobId, JobStatus};
use crate::snapshot::Snapshot;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;

/// Floor for the heartbeat period; a zero interval would spin.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: JobId,
    pub queue_position: usize,
    pub status: JobStatus,
}

/// Body of a successful cancel. `success` is always `true` here; a cancel
/// that finds nothing is a 404 with the `{error, code}` envelope instead.
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProgressQuery {
    #[serde(default)]
    pub job_id: Option<String>,
}

impl ProgressQuery {
    fn job_id(&self) -> Option<JobId> {
        non_empty(self.job_id.as_deref())
    }
}

#[derive(Debug, Serialize)]
pub struct FormatsResponse {
    pub formats: Vec<String>,
    pub book_only: Vec<String>,
    pub descriptions: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub target_id: String,
    pub formats: Vec<Format>,
    pub status: JobStatus,
    pub queue_position: usize,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&ExportJob> for QueueEntry {
    fn from(job: &ExportJob) -> Self {
        Self {
            job_id: job.id.clone(),
            target_id: job.target_id().to_string(),
            formats: job.spec.formats.clone(),
            status: job.status,
            queue_position: job.queue_position,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<QueueEntry>,
    pub pending: Vec<QueueEntry>,
}

/// POST /enqueue
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExportRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidPayload(e.body_text()))?;
    let enqueued = state.service.enqueue(request)?;

    Ok((
        StatusCode::CREATED,
        Json(EnqueueResponse {
            job_id: enqueued.job.id,
            queue_position: enqueued.queue_position,
            status: JobStatus::Queued,
        }),
    ))
}

/// POST /cancel
///
/// The body is optional; without a `job_id` the active job is targeted.
pub async fn cancel(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<AckResponse>> {
    let request: CancelRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidPayload(e.to_string()))?
    };

    let job_id = non_empty(request.job_id.as_deref());
    let ack = state.service.cancel(job_id.as_ref())?;
    Ok(Json(AckResponse {
        success: true,
        message: ack.message,
    }))
}

/// GET /progress
pub async fn progress(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgressQuery>,
) -> ApiResult<Json<Snapshot>> {
    let job_id = query.job_id();
    match state.service.poll(job_id.as_ref()) {
        Some(snapshot) => Ok(Json(Snapshot::clone(&snapshot))),
        None => Err(ApiError::NoProgress(match job_id {
            Some(id) => format!("No progress recorded for job {id}"),
            None => "No export has started yet".to_string(),
        })),
    }
}

/// GET /progress/stream
///
/// | Event       | When                                          |
/// |-------------|-----------------------------------------------|
/// | `progress`  | Latest snapshot on connect, then every change |
/// | `heartbeat` | Every `SSE_HEARTBEAT_SECS`, with `{timestamp}` |
pub async fn progress_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgressQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.service.subscribe(query.job_id());
    let heartbeat = state.sse_heartbeat.max(MIN_HEARTBEAT);

    let stream = async_stream::stream! {
        if let Some(initial) = subscription.take_initial() {
            yield Ok(progress_event(&initial));
        }

        let mut heartbeat_interval =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        loop {
            tokio::select! {
                next = subscription.recv() => {
                    match next {
                        Some(snapshot) => yield Ok(progress_event(&snapshot)),
                        None => break,
                    }
                }
                _ = heartbeat_interval.tick() => {
                    yield Ok(Event::default()
                        .event("heartbeat")
                        .data(json!({ "timestamp": Utc::now() }).to_string()));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat"))
}

fn progress_event(snapshot: &Snapshot) -> Event {
    Event::default()
        .event("progress")
        .data(serde_json::to_string(snapshot).unwrap_or_default())
}

/// GET /formats
pub async fn formats() -> Json<FormatsResponse> {
    Json(FormatsResponse {
        formats: Format::ALL.iter().map(|f| f.as_str().to_string()).collect(),
        book_only: Format::ALL
            .iter()
            .filter(|f| f.is_book_only())
            .map(|f| f.as_str().to_string())
            .collect(),
        descriptions: Format::ALL
            .iter()
            .map(|f| (f.as_str().to_string(), f.description().to_string()))
            .collect(),
    })
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /queue
pub async fn queue(State(state): State<Arc<AppState>>) -> Json<QueueResponse> {
    let view = state.service.queue_view();
    Json(QueueResponse {
        active: view.active.as_ref().map(QueueEntry::from),
        pending: view.pending.iter().map(QueueEntry::from).collect(),
    })
}

fn non_empty(value: Option<&str>) -> Option<JobId> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(JobId::from)
}
