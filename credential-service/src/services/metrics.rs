//! Prometheus metrics for credential-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use service_core::error::AppError;

/// Counter for validation attempts by recorded outcome.
pub static VALIDATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credential_validations_total",
        "Total number of credential validation attempts",
        &["result"]
    )
    .expect("Failed to register VALIDATIONS")
});

/// Histogram for end-to-end validation latency.
pub static VALIDATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "credential_validation_duration_seconds",
        "Credential validation duration in seconds",
        &["result"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register VALIDATION_DURATION")
});

/// Counter for fraud indicators raised, by kind.
pub static FRAUD_INDICATORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credential_fraud_indicators_total",
        "Total number of fraud indicators raised",
        &["kind"]
    )
    .expect("Failed to register FRAUD_INDICATORS")
});

/// Counter for applied lifecycle transitions, by target state.
pub static LIFECYCLE_TRANSITIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credential_lifecycle_transitions_total",
        "Total number of credential lifecycle transitions",
        &["to_state"]
    )
    .expect("Failed to register LIFECYCLE_TRANSITIONS")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "credential_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&VALIDATIONS);
    Lazy::force(&VALIDATION_DURATION);
    Lazy::force(&FRAUD_INDICATORS);
    Lazy::force(&LIFECYCLE_TRANSITIONS);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> Result<String, AppError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Metrics are not UTF-8: {}", e)))
}

/// Record a validation attempt and its duration.
pub fn record_validation(result: &str, duration_secs: f64) {
    VALIDATIONS.with_label_values(&[result]).inc();
    VALIDATION_DURATION
        .with_label_values(&[result])
        .observe(duration_secs);
}

/// Record a fraud indicator.
pub fn record_fraud_indicator(kind: &str) {
    FRAUD_INDICATORS.with_label_values(&[kind]).inc();
}

/// Record a lifecycle transition.
pub fn record_transition(to_state: &str) {
    LIFECYCLE_TRANSITIONS.with_label_values(&[to_state]).inc();
}
