//! HTTP Endpoints

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chatline_observability::create_metrics_router;
use chatline_pipeline::{BatchWorker, MessageSender, Pipeline, PipelineHealth};

/// Handles the health endpoint needs; reading it never blocks on I/O
#[derive(Clone)]
pub struct AppState {
    sender: Arc<MessageSender>,
    workers: Vec<Arc<BatchWorker>>,
}

impl AppState {
    pub fn new(sender: Arc<MessageSender>, workers: Vec<Arc<BatchWorker>>) -> Self {
        Self { sender, workers }
    }

    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(pipeline.sender(), pipeline.workers().to_vec())
    }

    pub fn workers(&self) -> &[Arc<BatchWorker>] {
        &self.workers
    }

    pub fn health(&self) -> PipelineHealth {
        PipelineHealth::new(
            self.sender.breaker_state(),
            self.workers.iter().map(|w| w.health()).collect(),
        )
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health();
    let status = if health.is_available() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// `/health` plus the Prometheus `/metrics` route
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
        .merge(create_metrics_router())
}
