use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chatline_core::IdGenerator;
use chatline_pipeline::{
    BatchWorker, CircuitBreakerConfig, LogDeadLetterSink, MemoryBuffer, MessageBuffer,
    MessageSender, StoreWriter, WorkerConfig,
};
use chatline_server::{create_router, AppState};
use chatline_store::SqliteMessageStore;
use tower::ServiceExt;

async fn state(worker_breaker: CircuitBreakerConfig) -> AppState {
    let ids: &'static IdGenerator = Box::leak(Box::new(IdGenerator::new(51).unwrap()));
    let store = Arc::new(SqliteMessageStore::new_in_memory().await.unwrap());
    let primary: Arc<dyn MessageBuffer> = Arc::new(MemoryBuffer::new("primary", 10));
    let fallback: Arc<dyn MessageBuffer> = Arc::new(MemoryBuffer::new("fallback", 10));

    let config = WorkerConfig {
        breaker: worker_breaker.clone(),
        ..WorkerConfig::default()
    };
    let workers = [primary.clone(), fallback.clone()]
        .into_iter()
        .map(|buffer| {
            Arc::new(BatchWorker::new(
                buffer.name().to_string(),
                buffer,
                Arc::new(StoreWriter::new(store.clone())),
                Arc::new(LogDeadLetterSink),
                config.clone(),
            ))
        })
        .collect();

    let sender = Arc::new(MessageSender::new(ids, primary, fallback, worker_breaker));
    AppState::new(sender, workers)
}

async fn get(state: AppState, uri: &str) -> (StatusCode, String) {
    let response = create_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_health_reports_workers() {
    let (status, body) = get(state(CircuitBreakerConfig::default()).await, "/health").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["send_breaker"], "closed");
    assert_eq!(health["workers"].as_array().unwrap().len(), 2);
    assert_eq!(health["workers"][0]["name"], "primary");
}

#[tokio::test]
async fn test_health_is_unavailable_when_all_breakers_open() {
    let state = state(CircuitBreakerConfig::default()).await;
    for worker in state.workers() {
        worker.breaker().trip();
    }

    let (status, body) = get(state, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let health: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "unavailable");
}

#[tokio::test]
async fn test_metrics_route_is_mounted() {
    chatline_observability::init_metrics();
    let (status, body) = get(state(CircuitBreakerConfig::default()).await, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("chatline_uptime_seconds"));
}
