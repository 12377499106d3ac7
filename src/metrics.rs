//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to render the exposition
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a task handed to a worker
pub fn record_task_submitted(model: &str, method: &str) {
    metrics::counter!("infer_mux_tasks_submitted_total",
        "model" => model.to_string(),
        "method" => method.to_string()
    )
    .increment(1);
}

/// Record a request refused before reaching a worker
pub fn record_task_rejected(model: &str, reason: &'static str) {
    metrics::counter!("infer_mux_tasks_rejected_total",
        "model" => model.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a result carrying an error status
pub fn record_task_failed(model: &str) {
    metrics::counter!("infer_mux_tasks_failed_total",
        "model" => model.to_string()
    )
    .increment(1);
}

pub fn record_worker_lost(worker: &str) {
    metrics::counter!("infer_mux_workers_lost_total",
        "worker" => worker.to_string()
    )
    .increment(1);
}

/// Time from submission to the terminal result
pub fn record_task_duration(model: &str, seconds: f64) {
    metrics::histogram!("infer_mux_task_duration_seconds",
        "model" => model.to_string()
    )
    .record(seconds);
}

/// Update pending request gauge
pub fn update_pending(count: usize) {
    metrics::gauge!("infer_mux_pending_requests").set(count as f64);
}
