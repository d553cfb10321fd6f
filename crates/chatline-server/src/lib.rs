//! Chatline Server
//!
//! Runs the persistence pipeline as a standalone process and exposes:
//! - `GET /health`: JSON [`PipelineHealth`](chatline_pipeline::PipelineHealth),
//!   503 when every worker breaker is open
//! - `GET /metrics`: Prometheus text format

pub mod config;
pub mod http;

pub use config::{open_store, ServerConfig};
pub use http::{create_router, AppState};
