use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::BuildError;

use crate::engine::EngineError;

// ── Booking operations ──────────────────────────────────────────

/// Counter: committed mutations. Labels: operation.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "studio_bookings_committed_total";

/// Counter: failed mutations. Labels: operation, kind.
pub const BOOKING_ERRORS_TOTAL: &str = "studio_bookings_errors_total";

/// Counter: writes refused because the interval was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "studio_bookings_conflicts_total";

/// Counter: temporary bookings cancelled after their confirmation deadline.
pub const BOOKINGS_AUTO_CANCELLED_TOTAL: &str = "studio_bookings_auto_cancelled_total";

/// Histogram: orchestrator operation latency in seconds. Labels: operation.
pub const OPERATION_DURATION_SECONDS: &str = "studio_bookings_operation_duration_seconds";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "studio_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "studio_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "studio_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record latency and outcome of one orchestrator operation.
pub fn record_outcome<T>(operation: &'static str, started: Instant, result: &Result<T, EngineError>) {
    metrics::histogram!(OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
    match result {
        Ok(_) => metrics::counter!(BOOKINGS_COMMITTED_TOTAL, "operation" => operation).increment(1),
        Err(e) => {
            if matches!(e, EngineError::Conflict(_)) {
                metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            }
            metrics::counter!(BOOKING_ERRORS_TOTAL, "operation" => operation, "kind" => e.kind()).increment(1);
        }
    }
}
