use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "operations_scheduler";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Operation Metrics
    pub static ref OPERATION_CLAIMS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_operation_claims_total"), "Claim attempts by outcome"),
        &["op_type", "outcome"]
    ).expect("Failed to create operation_claims_total metric");

    pub static ref OPERATION_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_operation_transitions_total"),
            "Operation lifecycle transitions"
        ),
        &["op_type", "transition"]
    ).expect("Failed to create operation_transitions_total metric");

    pub static ref MAINTENANCE_ROWS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_maintenance_rows_total"),
            "Rows touched by maintenance jobs"
        ),
        &["job"]
    ).expect("Failed to create maintenance_rows_total metric");

    // Cron Job Metrics
    pub static ref CRON_JOB_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_cron_job_runs_total"), "Periodic job executions"),
        &["job"]
    ).expect("Failed to create cron_job_runs_total metric");

    pub static ref CRON_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_cron_job_duration_seconds"),
            "Periodic job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 1.0, 10.0, 60.0, 300.0]),
        &["job"]
    ).expect("Failed to create cron_job_duration_seconds metric");

    pub static ref LEASE_LEADER: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_lease_leader"), "1 while this instance holds the lease"),
        &["lease"]
    ).expect("Failed to create lease_leader metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(OPERATION_CLAIMS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(OPERATION_TRANSITIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(MAINTENANCE_ROWS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CRON_JOB_RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CRON_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(LEASE_LEADER.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// `outcome` is one of `claimed`, `empty` or `error`.
pub fn record_claim(op_type: &str, outcome: &str) {
    OPERATION_CLAIMS_TOTAL
        .with_label_values(&[op_type, outcome])
        .inc();
}

pub fn record_transition(op_type: &str, transition: &str) {
    OPERATION_TRANSITIONS_TOTAL
        .with_label_values(&[op_type, transition])
        .inc();
}

pub fn record_maintenance_rows(job: &str, rows: usize) {
    MAINTENANCE_ROWS_TOTAL
        .with_label_values(&[job])
        .inc_by(rows as f64);
}

pub fn record_cron_job_run(job: &str, duration: Duration) {
    CRON_JOB_RUNS_TOTAL.with_label_values(&[job]).inc();
    CRON_JOB_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(duration.as_secs_f64());
}

pub fn set_lease_leader(lease: &str, leading: bool) {
    LEASE_LEADER
        .with_label_values(&[lease])
        .set(if leading { 1.0 } else { 0.0 });
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
