use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("database error: {0}")]
    Database(#[from] crate::models::Error),
    #[error("not found")]
    NotFound,
    #[error("invalid signature")]
    InvalidSignature,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response<axum::body::Body> {
        error!("webhook server error: {self}");

        let (status, message) = match self {
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage error"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found"),
            ApiError::InvalidSignature => (StatusCode::UNAUTHORIZED, "invalid signature"),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
