use axum::{
    extract::DefaultBodyLimit,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tessera_core::{observability, AppState};

pub mod error;
pub mod routes;

/// Payloads ride in JSON request bodies, so the transport bound doubles as
/// the practical payload bound.
const REQUEST_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/messages", post(routes::messages::submit_message))
        .route(
            "/api/v1/chats/{chat_id}/root",
            get(routes::chats::latest_root),
        )
        .layer(DefaultBodyLimit::max(REQUEST_BODY_LIMIT_BYTES))
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn metrics() -> impl IntoResponse {
    let counters = observability::snapshot();
    let body = format!(
        "# TYPE tessera_messages_submitted_total counter\n\
         tessera_messages_submitted_total {}\n\
         # TYPE tessera_messages_deduplicated_total counter\n\
         tessera_messages_deduplicated_total {}\n\
         # TYPE tessera_batches_committed_total counter\n\
         tessera_batches_committed_total {}\n\
         # TYPE tessera_messages_batched_total counter\n\
         tessera_messages_batched_total {}\n\
         # TYPE tessera_flush_failures_total counter\n\
         tessera_flush_failures_total {}\n\
         # TYPE tessera_ids_requeued_total counter\n\
         tessera_ids_requeued_total {}\n\
         # TYPE tessera_orphans_reconciled_total counter\n\
         tessera_orphans_reconciled_total {}\n",
        counters.messages_submitted,
        counters.messages_deduplicated,
        counters.batches_committed,
        counters.messages_batched,
        counters.flush_failures,
        counters.ids_requeued,
        counters.orphans_reconciled,
    );
    ([("content-type", "text/plain; charset=utf-8")], body)
}
