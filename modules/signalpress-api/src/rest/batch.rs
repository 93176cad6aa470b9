use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use signalpress_common::Usd;
use signalpress_pipeline::batch::{InitiateBatch, SessionView};

use crate::{ApiError, AppState};

#[derive(Deserialize)]
pub struct InitiateRequest {
    /// Dollars.
    budget_cap: f64,
    batch_size: Option<u32>,
    max_items: Option<usize>,
}

pub async fn api_initiate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitiateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !body.budget_cap.is_finite() || body.budget_cap <= 0.0 {
        return Err(ApiError::BadRequest(
            "budget_cap must be a positive dollar amount".to_string(),
        ));
    }

    let session = state
        .orchestrator
        .initiate(InitiateBatch {
            budget_cap: Usd::from_dollars(body.budget_cap),
            batch_size: body.batch_size,
            max_items: body.max_items,
        })
        .await?;

    info!(session_id = %session.id, status = %session.status, "Batch initiated via API");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "session_id": session.id,
            "status": session.status,
            "items": session.item_ids.len(),
        })),
    ))
}

pub async fn api_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    state
        .orchestrator
        .summary(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no batch session {id}")))
}
