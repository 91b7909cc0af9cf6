use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tessera_cache::MemoryStore;
use tessera_core::{AppState, Engine, EngineConfig, SqlStore};
use tessera_merkle::{digest, encode_hex};
use tower::ServiceExt;

struct TestContext {
    app: Router,
    engine: Arc<Engine>,
}

impl TestContext {
    async fn new() -> Self {
        let pool = tessera_db::create_pool("sqlite::memory:", 1)
            .await
            .expect("pool");
        tessera_db::run_migrations(&pool).await.expect("migrations");

        let config = EngineConfig {
            batch_size: 64,
            batch_timeout: Duration::from_millis(100),
            ..EngineConfig::default()
        };
        let engine = Engine::new(
            config,
            Arc::new(SqlStore::new(pool)),
            Arc::new(MemoryStore::new()),
        );
        let state = AppState {
            engine: Arc::clone(&engine),
        };
        let app = tessera_api::build_router().with_state(state);
        Self { app, engine }
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        let request = if let Some(body) = body {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            builder.body(Body::from(body.to_string())).expect("request")
        } else {
            builder.body(Body::empty()).expect("request")
        };

        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("infallible service");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }
}

#[tokio::test]
async fn submit_accepts_and_returns_a_message_id() {
    let ctx = TestContext::new().await;

    let (status, body) = ctx
        .request_json(
            Method::POST,
            "/api/v1/messages",
            Some(json!({ "chat_id": 1, "user_id": 42, "payload": "hello" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
    assert!(body["message_id"].as_i64().expect("id") > 0);
}

#[tokio::test]
async fn submit_rejects_non_positive_ids() {
    let ctx = TestContext::new().await;

    let (status, _) = ctx
        .request_json(
            Method::POST,
            "/api/v1/messages",
            Some(json!({ "chat_id": 0, "user_id": 42, "payload": "x" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = ctx
        .request_json(
            Method::POST,
            "/api/v1/messages",
            Some(json!({ "chat_id": 1, "user_id": -3, "payload": "x" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn repeated_idempotency_key_returns_the_same_id() {
    let ctx = TestContext::new().await;
    let payload = json!({
        "chat_id": 1,
        "user_id": 7,
        "payload": "x",
        "idempotency_key": "K",
    });

    let (status, first) = ctx
        .request_json(Method::POST, "/api/v1/messages", Some(payload.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) = ctx
        .request_json(Method::POST, "/api/v1/messages", Some(payload))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["message_id"], second["message_id"]);
}

#[tokio::test]
async fn root_query_is_404_until_a_batch_commits() {
    let ctx = TestContext::new().await;

    let (status, _) = ctx
        .request_json(Method::GET, "/api/v1/chats/1/root", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = ctx
        .request_json(
            Method::POST,
            "/api/v1/messages",
            Some(json!({ "chat_id": 1, "user_id": 42, "payload": "hello" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    ctx.engine
        .flush_chat(1)
        .await
        .expect("flush")
        .expect("batch");

    let (status, body) = ctx
        .request_json(Method::GET, "/api/v1/chats/1/root", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chat_id"], 1);
    assert_eq!(body["root"], encode_hex(&digest(b"hello")));
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let ctx = TestContext::new().await;

    let response = ctx
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("infallible service");
    assert_eq!(response.status(), StatusCode::OK);

    let response = ctx
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("infallible service");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let text = String::from_utf8(bytes.to_vec()).expect("utf8");
    assert!(text.contains("tessera_messages_submitted_total"));
    assert!(text.contains("tessera_batches_committed_total"));
}
