//! HTTP surface.
//!
//! Routes:
//! - POST /enqueue - Validate and queue an export job
//! - GET  /progress?job_id= - Latest snapshot for a job or the active job
//! - GET  /progress/stream?job_id= - SSE stream of `progress` events
//! - POST /cancel - Cancel a queued job or the active one
//! - GET  /formats - Supported output formats
//! - GET  /queue - Active and pending jobs
//! - GET  /health - Liveness and uptime

pub mod error;
pub mod handlers;

use crate::service::ExportService;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

/// State shared by all handlers.
#[derive(Debug)]
pub struct AppState {
    pub service: ExportService,
    pub started_at: Instant,
    /// Interval between SSE keep-alive comments.
    pub sse_heartbeat: Duration,
}

impl AppState {
    pub fn new(service: ExportService, sse_heartbeat: Duration) -> Arc<Self> {
        Arc::new(Self {
            service,
            started_at: Instant::now(),
            sse_heartbeat,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/enqueue", post(handlers::enqueue))
        .route("/progress", get(handlers::progress))
        .route("/progress/stream", get(handlers::progress_stream))
        .route("/cancel", post(handlers::cancel))
        .route("/formats", get(handlers::formats))
        .route("/queue", get(handlers::queue))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
