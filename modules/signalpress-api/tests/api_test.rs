use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use signalpress_api::{router, AppState};
use signalpress_common::{FileConfig, Newsletter, NewsletterKind, QualityMetrics, Usd};
use signalpress_pipeline::generation::GenerationRunner;
use signalpress_pipeline::testing::{
    store_with_articles, test_deps, MockAnalyzer, MockComposer, RecordingQueue,
};
use signalpress_store::{MemoryStore, NewsletterStore};

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    queue: Arc<RecordingQueue>,
}

async fn harness() -> Harness {
    let store = store_with_articles(10).await;
    let queue = Arc::new(RecordingQueue::new());
    let deps = test_deps(
        store.clone(),
        Arc::new(MockAnalyzer::new(Usd::from_dollars(0.0013))),
        Arc::new(MockComposer::new()),
        queue.clone(),
        FileConfig::default(),
    );
    let runner = Arc::new(GenerationRunner::new(deps.clone()));
    let app = router(Arc::new(AppState::new(deps, runner)));
    Harness { app, store, queue }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_check() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn generate_returns_task_and_progress_is_pollable() {
    let h = harness().await;

    let (status, body) = send(&h.app, "POST", "/api/generate", Some(json!({ "type": "daily" }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task_id"].as_str().unwrap().to_string();
    assert_eq!(body["progress_endpoint"], format!("/api/progress/{task_id}"));
    assert_eq!(h.queue.len(), 1);

    let (status, progress) = send(&h.app, "GET", &format!("/api/progress/{task_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["status"], "IN_PROGRESS");
    assert_eq!(progress["current_step"], "SELECTION");

    // A second request while the run is active joins it.
    let (status, again) = send(&h.app, "POST", "/api/generate", Some(json!({ "type": "daily" }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(again["task_id"], task_id.as_str());
    assert_eq!(again["existing"], true);
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn generate_conflicts_when_the_period_is_already_published() {
    let h = harness().await;
    let now = Utc::now();
    let existing = Newsletter {
        id: Uuid::new_v4(),
        kind: NewsletterKind::Weekly,
        period_key: NewsletterKind::Weekly.period_key(now),
        title: "This week".into(),
        body: "body".into(),
        citations: vec![],
        quality_metrics: QualityMetrics::default(),
        degradations: vec![],
        task_id: Uuid::new_v4(),
        created_at: now,
    };
    h.store.save_newsletter(&existing).await.unwrap();

    let (status, body) = send(&h.app, "POST", "/api/generate", Some(json!({ "type": "weekly" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["newsletter_id"], existing.id.to_string());

    let (status, _) = send(
        &h.app,
        "POST",
        "/api/generate",
        Some(json!({ "type": "weekly", "force": true })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn unknown_progress_is_not_found() {
    let h = harness().await;
    let uri = format!("/api/progress/{}", Uuid::new_v4());
    let (status, _) = send(&h.app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&h.app, "GET", &format!("{uri}/stream"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn initiate_batch_and_read_the_session() {
    let h = harness().await;

    let (status, body) = send(
        &h.app,
        "POST",
        "/api/batch/initiate",
        Some(json!({ "budget_cap": 0.30, "batch_size": 4 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let session_id = body["session_id"].as_str().unwrap().to_string();
    assert_eq!(body["items"], 10);
    // 10 items in batches of 4.
    assert_eq!(h.queue.len(), 3);

    let (status, session) =
        send(&h.app, "GET", &format!("/api/batch/session/{session_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["status"], "RUNNING");
    assert_eq!(session["counts"]["pending"], 10);
    assert_eq!(session["budget_cap"], 0.3);
}

#[tokio::test]
async fn initiate_rejects_bad_input() {
    let h = harness().await;

    let (status, _) = send(
        &h.app,
        "POST",
        "/api/batch/initiate",
        Some(json!({ "budget_cap": 0.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &h.app,
        "POST",
        "/api/batch/initiate",
        Some(json!({ "budget_cap": 1.0, "batch_size": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "batch size must be at least 1");
    assert!(h.queue.is_empty());

    let uri = format!("/api/batch/session/{}", Uuid::new_v4());
    assert_eq!(send(&h.app, "GET", &uri, None).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn alerts_list_starts_empty() {
    let h = harness().await;
    let (status, body) = send(&h.app, "GET", "/api/alerts?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}
