use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tessera_core::AppState;

use crate::error::ApiError;

#[derive(Deserialize)]
pub struct SubmitMessageRequest {
    pub chat_id: i64,
    pub user_id: i64,
    /// Message bytes; the engine commits to exactly these bytes.
    pub payload: String,
    pub idempotency_key: Option<String>,
}

#[derive(Serialize)]
pub struct SubmitMessageResponse {
    pub message_id: i64,
    pub status: &'static str,
}

/// Durably record a message and enqueue it for batching. Retries carrying
/// the same `idempotency_key` return the original id without a second row.
pub async fn submit_message(
    State(state): State<AppState>,
    Json(req): Json<SubmitMessageRequest>,
) -> Result<Json<SubmitMessageResponse>, ApiError> {
    if req.chat_id <= 0 {
        return Err(ApiError::BadRequest("chat_id must be positive".into()));
    }
    if req.user_id <= 0 {
        return Err(ApiError::BadRequest("user_id must be positive".into()));
    }

    let message_id = state
        .engine
        .submit_message(
            req.chat_id,
            req.user_id,
            req.payload.as_bytes(),
            req.idempotency_key.as_deref(),
        )
        .await?;

    Ok(Json(SubmitMessageResponse {
        message_id,
        status: "accepted",
    }))
}
