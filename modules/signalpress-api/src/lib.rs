//! HTTP surface for newsletter generation, batch analysis and alerts.

use std::sync::Arc;

use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;

use signalpress_pipeline::batch::BatchOrchestrator;
use signalpress_pipeline::generation::{GenerationRunner, ProgressTracker};
use signalpress_pipeline::PipelineDeps;
use signalpress_store::Store;

pub mod error;
pub mod rest;

pub use error::ApiError;

pub struct AppState {
    pub orchestrator: BatchOrchestrator,
    pub runner: Arc<GenerationRunner>,
    pub progress: Arc<ProgressTracker>,
    pub store: Arc<dyn Store>,
}

impl AppState {
    pub fn new(deps: PipelineDeps, runner: Arc<GenerationRunner>) -> Self {
        Self {
            orchestrator: BatchOrchestrator::new(deps.clone()),
            progress: deps.progress.clone(),
            store: deps.store.clone(),
            runner,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/api/generate", post(rest::generation::api_generate))
        .route("/api/progress/{task_id}", get(rest::generation::api_progress))
        .route(
            "/api/progress/{task_id}/stream",
            get(rest::generation::api_progress_stream),
        )
        .route("/api/batch/initiate", post(rest::batch::api_initiate))
        .route("/api/batch/session/{id}", get(rest::batch::api_session))
        .route("/api/alerts", get(rest::api_alerts))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}
