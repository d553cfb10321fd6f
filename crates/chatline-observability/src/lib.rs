//! Chatline Observability
//!
//! Prometheus metrics for the persistence pipeline and the `/metrics` router.
//!
//! # Usage
//!
//! ```no_run
//! use chatline_observability::{exporter, metrics};
//!
//! metrics::init();
//! let router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use exporter::create_metrics_router;
pub use metrics::{init as init_metrics, REGISTRY};
