use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use signalpress_pipeline::batch::InitiateError;
use signalpress_pipeline::generation::{GenerateError, ProgressError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Conflict {
        message: String,
        newsletter_id: Uuid,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Conflict {
                message,
                newsletter_id,
            } => (
                StatusCode::CONFLICT,
                Json(json!({ "error": message, "newsletter_id": newsletter_id })),
            )
                .into_response(),
            ApiError::Internal(e) => {
                warn!(error = %format!("{e:#}"), "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<GenerateError> for ApiError {
    fn from(e: GenerateError) -> Self {
        let message = e.to_string();
        match e {
            GenerateError::AlreadyGenerated { newsletter_id, .. } => ApiError::Conflict {
                message,
                newsletter_id,
            },
            GenerateError::Internal(inner) => ApiError::Internal(inner),
        }
    }
}

impl From<InitiateError> for ApiError {
    fn from(e: InitiateError) -> Self {
        match e {
            InitiateError::Internal(inner) => ApiError::Internal(inner),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<ProgressError> for ApiError {
    fn from(e: ProgressError) -> Self {
        match e {
            ProgressError::UnknownTask(id) => ApiError::NotFound(format!("no generation run {id}")),
            other => ApiError::Internal(other.into()),
        }
    }
}
