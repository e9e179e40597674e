// Process-wide Prometheus metrics, exposed on GET /metrics

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref CONTAINERS_OWNED: IntGauge = register_int_gauge!(
        "arbiter_containers_owned",
        "Containers created by pipelines and not yet removed"
    )
    .expect("metric can be registered");
    pub static ref AGENT_RETRIES: IntCounter = register_int_counter!(
        "arbiter_agent_retries_total",
        "Agent requests repeated after a failed attempt"
    )
    .expect("metric can be registered");
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "arbiter_submissions_total",
        "Submissions that reached a terminal status",
        &["outcome"]
    )
    .expect("metric can be registered");
    pub static ref TESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "arbiter_tests_total",
        "Tests judged, by verdict",
        &["verdict"]
    )
    .expect("metric can be registered");
    pub static ref PIPELINE_DURATION: Histogram = register_histogram!(
        "arbiter_pipeline_duration_seconds",
        "Wall-clock time from pipeline start to terminal status",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("metric can be registered");
}

/// Text exposition of every registered metric
pub fn render() -> String {
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
