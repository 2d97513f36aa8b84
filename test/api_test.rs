/// HTTP tests for the export queue API.
///
/// Requests go straight into the router with `tower::ServiceExt::oneshot`;
/// no socket is bound and no worker runs unless a test starts one.
///
/// ## Running Tests
///
/// ```bash
/// cargo test --test api_test
/// ```

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use export_queue::api::{self, AppState};
    use export_queue::broadcast::ProgressBroadcaster;
    use export_queue::job::{ExportRequest, JobStatus};
    use export_queue::service::ExportService;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_stream::StreamExt;
    use tower::ServiceExt;

    fn setup() -> (ExportService, Router) {
        setup_with_heartbeat(Duration::from_secs(15))
    }

    fn setup_with_heartbeat(heartbeat: Duration) -> (ExportService, Router) {
        let service = ExportService::new(ProgressBroadcaster::default(), std::env::temp_dir());
        let app = api::router(AppState::new(service.clone(), heartbeat));
        (service, app)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_returns_created_with_position() {
        let (_, app) = setup();

        let (status, body) = send(
            &app,
            post_json("/enqueue", json!({ "target_id": "book-1", "formats": ["epub"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["queue_position"], 0);
        assert_eq!(body["status"], "queued");
        assert!(body["job_id"].as_str().is_some_and(|id| !id.is_empty()));

        let (_, second) = send(
            &app,
            post_json("/enqueue", json!({ "target_id": "book-2", "formats": "pdf,pdf-chapters" })),
        )
        .await;
        assert_eq!(second["queue_position"], 1);
    }

    #[tokio::test]
    async fn test_enqueue_validation_errors() {
        let (service, app) = setup();

        let (status, body) = send(
            &app,
            post_json(
                "/enqueue",
                json!({ "target_id": "book-1", "formats": ["epub"], "chapters": [1, 2] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "chapters_not_supported_for_format");
        assert_eq!(body["details"]["unsupported_formats"], json!(["epub"]));

        let (status, body) = send(&app, post_json("/enqueue", json!({ "formats": ["pdf"] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "target_id_required");

        let (status, body) = send(
            &app,
            post_json("/enqueue", json!({ "target_id": "book-1", "formats": ["docx"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_format");

        // Nothing was admitted.
        assert!(service.queue_view().pending.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_malformed_json_is_invalid_payload() {
        let (_, app) = setup();
        let request = Request::builder()
            .method("POST")
            .uri("/enqueue")
            .header("content-type", "application/json")
            .body(Body::from("{ not json"))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_payload");
    }

    #[tokio::test]
    async fn test_progress_not_found_then_queued() {
        let (_, app) = setup();

        let (status, body) = send(&app, get("/progress")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        let (status, _) = send(&app, get("/progress?job_id=missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, enqueued) = send(
            &app,
            post_json("/enqueue", json!({ "target_id": "book-1", "formats": ["pdf"] })),
        )
        .await;
        let job_id = enqueued["job_id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, get(&format!("/progress?job_id={job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job_id"], job_id.as_str());
        assert_eq!(body["status"], "queued");
        assert_eq!(body["queue_position"], 0);
    }

    #[tokio::test]
    async fn test_cancel_without_active_job_is_not_found() {
        let (_, app) = setup();
        let request = Request::builder()
            .method("POST")
            .uri("/cancel")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
        // Failures use the error envelope, never `success: false`.
        assert!(body.get("success").is_none());
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_cancel_queued_job_by_id() {
        let (service, app) = setup();
        let first = service
            .enqueue(ExportRequest::new("book-1", &["epub"]))
            .unwrap();
        let second = service
            .enqueue(ExportRequest::new("book-2", &["epub"]))
            .unwrap();

        let (status, body) = send(
            &app,
            post_json("/cancel", json!({ "job_id": first.job.id.as_str() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["message"].as_str().unwrap().contains(first.job.id.as_str()));

        let (_, queue) = send(&app, get("/queue")).await;
        assert_eq!(queue["pending"][0]["job_id"], second.job.id.as_str());
        assert_eq!(queue["pending"][0]["queue_position"], 0);
        assert!(queue.get("active").is_none());

        let cancelled = service.poll(Some(&first.job.id)).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_rejects_malformed_body() {
        let (_, app) = setup();
        let request = Request::builder()
            .method("POST")
            .uri("/cancel")
            .body(Body::from("job_id=abc"))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_payload");
    }

    #[tokio::test]
    async fn test_formats() {
        let (_, app) = setup();
        let (status, body) = send(&app, get("/formats")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["formats"], json!(["epub", "pdf", "pdf-chapters"]));
        assert_eq!(body["book_only"], json!(["epub"]));
        assert!(body["descriptions"]["pdf-chapters"].is_string());
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = setup();
        let (status, body) = send(&app, get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn test_stream_replays_latest_snapshot_first() {
        let (service, app) = setup();
        let job = service
            .enqueue(ExportRequest::new("book-1", &["pdf"]))
            .unwrap()
            .job;

        let response = app
            .clone()
            .oneshot(get(&format!("/progress/stream?job_id={}", job.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let mut frames = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(2), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(first.to_vec()).unwrap();
        assert!(text.starts_with("event: progress\n"), "{text}");

        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        let snapshot: Value = serde_json::from_str(data).unwrap();
        assert_eq!(snapshot["job_id"], job.id.as_str());
        assert_eq!(snapshot["status"], "queued");
    }

    #[tokio::test]
    async fn test_stream_delivers_live_updates() {
        let (service, app) = setup();
        let job = service
            .enqueue(ExportRequest::new("book-1", &["pdf"]))
            .unwrap()
            .job;

        let response = app
            .clone()
            .oneshot(get(&format!("/progress/stream?job_id={}", job.id)))
            .await
            .unwrap();
        let mut frames = response.into_body().into_data_stream();
        // Replay of the queued snapshot.
        frames.next().await.unwrap().unwrap();

        service.cancel(Some(&job.id)).unwrap();

        let next = tokio::time::timeout(Duration::from_secs(2), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(next.to_vec()).unwrap();
        assert!(text.contains("\"status\":\"cancelled\""), "{text}");
    }

    #[tokio::test]
    async fn test_stream_sends_named_heartbeats() {
        let (service, app) = setup_with_heartbeat(Duration::from_millis(50));
        let job = service
            .enqueue(ExportRequest::new("book-1", &["pdf"]))
            .unwrap()
            .job;

        let response = app
            .clone()
            .oneshot(get(&format!("/progress/stream?job_id={}", job.id)))
            .await
            .unwrap();
        let mut frames = response.into_body().into_data_stream();

        let heartbeat = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let frame = frames.next().await.unwrap().unwrap();
                let text = String::from_utf8(frame.to_vec()).unwrap();
                if text.starts_with("event: heartbeat\n") {
                    return text;
                }
            }
        })
        .await
        .unwrap();

        let data = heartbeat
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        let payload: Value = serde_json::from_str(data).unwrap();
        assert!(payload["timestamp"].is_string());
    }
}
