use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use tessera_core::AppState;
use tessera_merkle::encode_hex;

use crate::error::ApiError;

#[derive(Serialize)]
pub struct LatestRootResponse {
    pub chat_id: i64,
    /// Hex-encoded 32-byte Merkle root of the chat's newest batch.
    pub root: String,
}

/// Latest committed root for a chat; 404 until its first batch commits.
pub async fn latest_root(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
) -> Result<Json<LatestRootResponse>, ApiError> {
    if chat_id <= 0 {
        return Err(ApiError::BadRequest("chat_id must be positive".into()));
    }

    let root = state
        .engine
        .latest_root(chat_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(LatestRootResponse {
        chat_id,
        root: encode_hex(&root),
    }))
}
