//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tabula=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Install the Prometheus exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Rows committed into dynamic stores, by table and atomicity.
pub fn record_rows_written(path: &str, rows: usize, atomicity: &str) {
    metrics::counter!(
        "tabula_rows_written_total",
        "path" => path.to_string(),
        "atomicity" => atomicity.to_string()
    )
    .increment(rows as u64);
}

/// One lookup or select request.
pub fn record_lookup(path: &str, kind: &str, keys: usize, duration_us: u64, success: bool) {
    metrics::counter!(
        "tabula_reads_total",
        "kind" => kind.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("tabula_read_keys", "path" => path.to_string()).record(keys as f64);
    metrics::histogram!("tabula_read_duration_us", "kind" => kind.to_string()).record(duration_us as f64);
}

pub fn record_txn(action: &str) {
    metrics::counter!("tabula_txn_total", "action" => action.to_string()).increment(1);
}

/// Cell health as a gauge: 0=good, 1=degraded, 2=failed.
pub fn record_cell_health(cell: &str, health: &str) {
    let value = match health {
        "degraded" => 1.0,
        "failed" => 2.0,
        _ => 0.0,
    };
    metrics::gauge!("tabula_cell_health", "cell" => cell.to_string()).set(value);
}

pub fn record_chunk_counts(total: usize, sealed_pending: usize) {
    metrics::gauge!("tabula_chunk_count").set(total as f64);
    metrics::counter!("tabula_chunks_sealed_by_sealer_total").increment(sealed_pending as u64);
}

/// Store set changes (flush or compaction) applied to chunk trees.
pub fn record_store_updates(updates: usize) {
    metrics::counter!("tabula_store_updates_total").increment(updates as u64);
}

pub fn record_balancer_iteration(executed: usize, failed: usize, duration_us: u64) {
    metrics::counter!("tabula_balancer_iterations_total").increment(1);
    metrics::counter!("tabula_balancer_actions_total", "result" => "executed").increment(executed as u64);
    metrics::counter!("tabula_balancer_actions_total", "result" => "failed").increment(failed as u64);
    metrics::histogram!("tabula_balancer_iteration_duration_us").record(duration_us as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter_is_noop() {
        record_rows_written("//t", 3, "full");
        record_lookup("//t", "lookup", 2, 10, true);
        record_txn("commit");
        record_cell_health("cell-1", "degraded");
        record_chunk_counts(4, 0);
        record_store_updates(1);
        record_balancer_iteration(1, 0, 100);
    }

    #[test]
    fn test_invalid_metrics_address() {
        assert!(init_metrics("not an address").is_err());
    }
}
