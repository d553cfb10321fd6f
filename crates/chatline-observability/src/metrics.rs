use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

/// Encoded values of the `chatline_breaker_state` gauge
pub const BREAKER_CLOSED: i64 = 0;
pub const BREAKER_OPEN: i64 = 1;
pub const BREAKER_HALF_OPEN: i64 = 2;

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Send Path Metrics
    // ============================================================================

    /// Enqueue attempts by tier (primary, fallback) and result (accepted, full, unavailable, rejected)
    pub static ref ENQUEUE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatline_enqueue_total", "Enqueue attempts by buffer tier and result"),
        &["tier", "result"]
    ).expect("metric can be created");

    // ============================================================================
    // Buffer Metrics
    // ============================================================================

    /// Entries currently waiting in a buffer
    pub static ref BUFFER_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chatline_buffer_depth", "Entries waiting in a buffer"),
        &["buffer"]
    ).expect("metric can be created");

    // ============================================================================
    // Worker Metrics
    // ============================================================================

    /// Worker cycles by outcome (skipped, throttled, idle, written, failed, buffer_error)
    pub static ref CYCLES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatline_worker_cycles_total", "Worker cycles by outcome"),
        &["worker", "outcome"]
    ).expect("metric can be created");

    /// Records durably persisted
    pub static ref RECORDS_PERSISTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatline_records_persisted_total", "Records durably persisted"),
        &["worker"]
    ).expect("metric can be created");

    /// Records pushed back to a buffer for another attempt
    pub static ref RECORDS_REQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatline_records_requeued_total", "Records requeued for retry"),
        &["worker"]
    ).expect("metric can be created");

    /// Records routed to the dead-letter sink
    pub static ref RECORDS_DEAD_LETTERED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatline_records_dead_lettered_total", "Records routed to the dead-letter sink"),
        &["worker"]
    ).expect("metric can be created");

    /// Buffer entries that could not be decoded
    pub static ref RECORDS_DISCARDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatline_records_discarded_total", "Corrupt buffer entries discarded"),
        &["worker"]
    ).expect("metric can be created");

    /// Failed batch writes by error kind (transient, integrity, unknown)
    pub static ref WRITE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatline_write_errors_total", "Failed batch writes by error kind"),
        &["worker", "kind"]
    ).expect("metric can be created");

    /// Batch write latency
    pub static ref WRITE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chatline_write_latency_seconds", "Batch write latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["worker"]
    ).expect("metric can be created");

    /// Records per drained batch
    pub static ref BATCH_SIZE: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chatline_batch_size", "Drained batch size in records")
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        &["worker"]
    ).expect("metric can be created");

    /// Consecutive failed cycles as seen by the worker's breaker
    pub static ref CONSECUTIVE_FAILURES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chatline_consecutive_failures", "Consecutive write failures"),
        &["worker"]
    ).expect("metric can be created");

    /// Unix time (seconds) of the last successful batch write
    pub static ref LAST_SUCCESS_TIMESTAMP: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chatline_last_success_timestamp_seconds", "Unix time of the last successful write"),
        &["worker"]
    ).expect("metric can be created");

    // ============================================================================
    // Resilience Metrics
    // ============================================================================

    /// Circuit breaker state: 0 closed, 1 open, 2 half-open
    pub static ref BREAKER_STATE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chatline_breaker_state", "Circuit breaker state (0 closed, 1 open, 2 half-open)"),
        &["breaker"]
    ).expect("metric can be created");

    /// Current flow-control ceiling in records
    pub static ref FLOW_CEILING: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chatline_flow_ceiling", "Flow-control batch ceiling in records"),
        &["worker"]
    ).expect("metric can be created");

    // ============================================================================
    // System Metrics
    // ============================================================================

    /// Server uptime in seconds
    pub static ref UPTIME_SECONDS: IntGauge = IntGauge::new(
        "chatline_uptime_seconds",
        "Server uptime in seconds"
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Send path
        REGISTRY
            .register(Box::new(ENQUEUE_TOTAL.clone()))
            .expect("enqueue_total can be registered");

        // Buffers
        REGISTRY
            .register(Box::new(BUFFER_DEPTH.clone()))
            .expect("buffer_depth can be registered");

        // Workers
        REGISTRY
            .register(Box::new(CYCLES_TOTAL.clone()))
            .expect("worker_cycles_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_PERSISTED_TOTAL.clone()))
            .expect("records_persisted_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_REQUEUED_TOTAL.clone()))
            .expect("records_requeued_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_DEAD_LETTERED_TOTAL.clone()))
            .expect("records_dead_lettered_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_DISCARDED_TOTAL.clone()))
            .expect("records_discarded_total can be registered");
        REGISTRY
            .register(Box::new(WRITE_ERRORS_TOTAL.clone()))
            .expect("write_errors_total can be registered");
        REGISTRY
            .register(Box::new(WRITE_LATENCY.clone()))
            .expect("write_latency can be registered");
        REGISTRY
            .register(Box::new(BATCH_SIZE.clone()))
            .expect("batch_size can be registered");
        REGISTRY
            .register(Box::new(CONSECUTIVE_FAILURES.clone()))
            .expect("consecutive_failures can be registered");
        REGISTRY
            .register(Box::new(LAST_SUCCESS_TIMESTAMP.clone()))
            .expect("last_success_timestamp can be registered");

        // Resilience
        REGISTRY
            .register(Box::new(BREAKER_STATE.clone()))
            .expect("breaker_state can be registered");
        REGISTRY
            .register(Box::new(FLOW_CEILING.clone()))
            .expect("flow_ceiling can be registered");

        // System
        REGISTRY
            .register(Box::new(UPTIME_SECONDS.clone()))
            .expect("uptime_seconds can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        init();
    }

    #[test]
    fn test_worker_counters() {
        RECORDS_PERSISTED_TOTAL
            .with_label_values(&["test-worker"])
            .inc_by(50);
        WRITE_ERRORS_TOTAL
            .with_label_values(&["test-worker", "transient"])
            .inc();

        assert_eq!(
            RECORDS_PERSISTED_TOTAL
                .with_label_values(&["test-worker"])
                .get(),
            50
        );
        assert_eq!(
            WRITE_ERRORS_TOTAL
                .with_label_values(&["test-worker", "transient"])
                .get(),
            1
        );
    }

    #[test]
    fn test_breaker_state_gauge() {
        BREAKER_STATE
            .with_label_values(&["test-breaker"])
            .set(BREAKER_OPEN);
        assert_eq!(
            BREAKER_STATE.with_label_values(&["test-breaker"]).get(),
            BREAKER_OPEN
        );
    }
}
