use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The message was persisted but not enqueued; the id is returned so
    /// the caller knows the submission is durable and will be batched by
    /// the reconciliation sweep.
    #[error("message accepted but not enqueued")]
    EnqueueFailed { message_id: i64 },
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::NotFound => {
                let message = self.to_string();
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": message })),
                )
                    .into_response()
            }
            ApiError::BadRequest(_) => {
                let message = self.to_string();
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": message })),
                )
                    .into_response()
            }
            ApiError::EnqueueFailed { message_id } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": self.to_string(),
                    "message_id": message_id,
                })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<tessera_core::EngineError> for ApiError {
    fn from(e: tessera_core::EngineError) -> Self {
        use tessera_core::EngineError;
        match e {
            EngineError::EnqueueFailed { message_id, .. } => ApiError::EnqueueFailed { message_id },
            EngineError::StorageUnavailable(_) => {
                ApiError::Internal(anyhow::anyhow!("storage unavailable"))
            }
            EngineError::QueueUnavailable(_) => {
                ApiError::Internal(anyhow::anyhow!("queue unavailable"))
            }
            EngineError::InconsistentStore { chat_id } => {
                ApiError::Internal(anyhow::anyhow!("inconsistent store for chat {chat_id}"))
            }
            EngineError::Merkle(_) => ApiError::Internal(anyhow::anyhow!("merkle failure")),
        }
    }
}
