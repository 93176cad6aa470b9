use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use signalpress_common::{GenerationProgress, NewsletterKind};

use crate::{ApiError, AppState};

#[derive(Deserialize)]
pub struct GenerateRequest {
    #[serde(rename = "type")]
    kind: NewsletterKind,
    #[serde(default)]
    force: bool,
}

pub async fn api_generate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submitted = state.runner.submit(body.kind, body.force).await?;
    info!(
        task_id = %submitted.task_id,
        kind = %body.kind,
        force = body.force,
        existing = submitted.existing,
        "Generation requested"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": submitted.task_id,
            "progress_endpoint": format!("/api/progress/{}", submitted.task_id),
            "existing": submitted.existing,
        })),
    ))
}

pub async fn api_progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<GenerationProgress>, ApiError> {
    state
        .progress
        .read(task_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no generation run {task_id}")))
}

/// Server-sent `progress` events, one per committed change, ending after the
/// terminal state.
pub async fn api_progress_stream(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut rx = state.progress.subscribe(task_id).await?;

    let stream = async_stream::stream! {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            match Event::default().event("progress").json_data(&snapshot) {
                Ok(event) => yield Ok(event),
                Err(e) => {
                    warn!(%task_id, error = %e, "Failed to encode progress event");
                    break;
                }
            }
            if snapshot.is_terminal() || rx.changed().await.is_err() {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
