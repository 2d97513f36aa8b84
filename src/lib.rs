//! Export Queue Library
//!
//! A job queue for long-running content exports with a single active worker,
//! cooperative cancellation, and progress fan-out to polling and streaming
//! clients.
//!
//! ## Module Overview
//!
//! - `job`: Job identity, request validation, status set
//! - `snapshot`: Immutable progress records
//! - `queue`: Pending FIFO plus the active slot
//! - `scheduler`: The single worker loop
//! - `tracker`: Progress state machine for the active job
//! - `broadcast`: Poll/subscribe fan-out with replay and bounded buffers
//! - `retry`: Retry policy for individual transport calls
//! - `cancel`: Per-job cancellation token
//! - `orchestrator` / `exporter`: The seam to the export subsystem
//! - `service`: The explicit service instance handlers share
//! - `api`: HTTP surface with SSE progress stream
//! - `mirror`: Optional Redis write-through of snapshots
//! - `config`, `telemetry`: Environment config, logging and tracing
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use export_queue::{
//!     broadcast::ProgressBroadcaster,
//!     exporter::CommandOrchestrator,
//!     job::ExportRequest,
//!     scheduler::SchedulerSettings,
//!     service::ExportService,
//! };
//! use std::sync::Arc;
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = ExportService::new(ProgressBroadcaster::default(), "./output");
//!     service.spawn_worker(
//!         Arc::new(CommandOrchestrator::new("/usr/local/bin/exporter")),
//!         SchedulerSettings::default(),
//!     );
//!
//!     let enqueued = service
//!         .enqueue(ExportRequest::new("book-123", &["epub", "pdf"]))
//!         .unwrap();
//!     assert_eq!(enqueued.queue_position, 0);
//!
//!     // Replays the current snapshot first, so a job that already
//!     // finished still ends the loop.
//!     let updates = service.subscribe(Some(enqueued.job.id)).into_stream();
//!     tokio::pin!(updates);
//!     while let Some(snapshot) = updates.next().await {
//!         if snapshot.is_terminal() {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod api;
pub mod broadcast;
pub mod cancel;
pub mod config;
pub mod error;
pub mod exporter;
pub mod job;
pub mod mirror;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod telemetry;
pub mod tracker;
