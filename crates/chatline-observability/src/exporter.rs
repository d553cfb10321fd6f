//! `/metrics` endpoint
//!
//! Serves everything registered in [`REGISTRY`] in the Prometheus text
//! exposition format.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{TextEncoder, TEXT_FORMAT};

use crate::metrics::REGISTRY;

pub const METRICS_PATH: &str = "/metrics";

/// Encode the current value of every chatline metric
pub fn render() -> prometheus::Result<String> {
    TextEncoder::new().encode_to_string(&REGISTRY.gather())
}

async fn scrape() -> Response {
    match render() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("cannot encode chatline metrics: {}", e),
        )
            .into_response(),
    }
}

/// Router serving `GET /metrics`, merged into the application router
pub fn create_metrics_router() -> Router {
    Router::new().route(METRICS_PATH, get(scrape))
}
