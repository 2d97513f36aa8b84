//! Export Queue Service
//!
//! Accepts export jobs over HTTP, runs them one at a time through an external
//! exporter program, and reports progress by polling and SSE.
//!
//! ## Architecture
//!
//! - **Queue**: in-memory FIFO with a single active slot
//! - **Worker**: one task driving `EXPORT_COMMAND` per job
//! - **Progress**: `GET /progress` and `GET /progress/stream`
//! - **Status mirror**: Redis keys (`export:status:{job_id}`) when `REDIS_URL` is set
//! - **Telemetry**: OpenTelemetry OTLP export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//!
//! See [`export_queue::config::Config::from_env`] for every variable.

use anyhow::{Context, Result};
use export_queue::api::{self, AppState};
use export_queue::broadcast::{ProgressBroadcaster, SubscriptionTarget};
use export_queue::config::Config;
use export_queue::exporter::{CommandOrchestrator, MissingExporter};
use export_queue::mirror::StatusMirror;
use export_queue::orchestrator::Orchestrator;
use export_queue::service::ExportService;
use export_queue::telemetry;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    telemetry::init_tracing(config.log_json).context("Failed to initialize tracing")?;

    if let Some(endpoint) = &config.otlp_endpoint {
        if let Err(e) = telemetry::init_telemetry(endpoint, &config.service_name) {
            warn!("Failed to initialize telemetry: {:#}", e);
        }
    }

    info!("Starting export queue service");
    info!(
        "Configuration: addr={}, output_dir={}, redis={}, exporter={}",
        config.bind_addr(),
        config.output_dir.display(),
        config.redis_url.is_some(),
        config
            .export_command
            .as_ref()
            .map_or_else(|| "<none>".to_string(), |p| p.display().to_string())
    );

    let broadcaster = ProgressBroadcaster::new(config.subscriber_buffer, config.terminal_job_retention);
    let service = ExportService::new(broadcaster.clone(), config.output_dir.clone());

    let mirror = match &config.redis_url {
        Some(url) => match StatusMirror::connect(url, config.mirror_write_interval).await {
            Ok(mirror) => Some(mirror.spawn(broadcaster.subscribe(SubscriptionTarget::All))),
            Err(e) => {
                warn!("Status mirror disabled: {:#}", e);
                None
            }
        },
        None => None,
    };

    let orchestrator: Arc<dyn Orchestrator> = match &config.export_command {
        Some(program) => Arc::new(
            CommandOrchestrator::new(program).with_retry_policy(config.retry_policy()),
        ),
        None => {
            warn!("EXPORT_COMMAND is not set; every job will fail");
            Arc::new(MissingExporter)
        }
    };
    let worker = service.spawn_worker(orchestrator, config.scheduler_settings());

    let app = api::router(AppState::new(service.clone(), config.sse_heartbeat));
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;

    info!("Listening on {}, press Ctrl+C to shutdown", config.bind_addr());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service.clone()))
        .await
        .context("HTTP server failed")?;

    info!("Waiting for worker to finish...");
    if let Err(e) = worker.await {
        error!("Worker task failed: {}", e);
    }
    // The worker has published its last snapshot; the mirror may now drain.
    service.close_subscriptions();
    if let Some(mirror) = mirror {
        if let Err(e) = mirror.await {
            error!("Status mirror task failed: {}", e);
        }
    }

    telemetry::shutdown_telemetry();
    info!("Export queue service shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C after stopping the worker and ending client streams,
/// so the server can drain its connections.
async fn shutdown_signal(service: ExportService) {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
    service.shutdown();
    service.close_streams();
}
