pub mod batch;
pub mod generation;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::Deserialize;

use signalpress_common::Alert;

use crate::{ApiError, AppState};

const DEFAULT_ALERT_LIMIT: usize = 50;
const MAX_ALERT_LIMIT: usize = 500;

#[derive(Deserialize)]
pub struct AlertsQuery {
    limit: Option<usize>,
}

/// Most recent alerts, newest first.
pub async fn api_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertsQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_ALERT_LIMIT)
        .clamp(1, MAX_ALERT_LIMIT);
    Ok(Json(state.store.recent_alerts(limit).await?))
}
