use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // Storage Metrics
    pub static ref ANSWERS_SAVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answers_saved_total",
        "Total number of answers written through the storage facade",
        &["backend", "type"]
    )
    .unwrap();

    pub static ref STORAGE_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "storage_operation_duration_seconds",
        "Storage operation duration in seconds",
        &["operation", "backend"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap();

    // Offline -> online push
    pub static ref ANSWERS_PUSHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answers_pushed_total",
        "Total number of offline answers pushed to the remote store",
        &["status"]
    )
    .unwrap();

    // Sync gate
    pub static ref SYNC_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_runs_total",
        "Total number of data sync tracker runs",
        &["outcome"]
    )
    .unwrap();

    pub static ref PLUGIN_SYNC_STATUS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "plugin_sync_status_total",
        "Plugin heartbeat statuses received during sync runs",
        &["status"]
    )
    .unwrap();

    pub static ref LOG_ENTRIES_FLUSHED_TOTAL: IntCounter = register_int_counter!(
        "log_entries_flushed_total",
        "Total number of buffered log entries delivered to the log sink"
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: time a storage operation against the given backend
pub async fn track_storage_operation<F, T, E>(
    operation: &str,
    backend: &str,
    future: F,
) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let result = future.await;

    STORAGE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, backend])
        .observe(start.elapsed().as_secs_f64());

    result
}
