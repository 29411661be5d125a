use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: orchestrator operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "carhold_operations_total";

/// Histogram: orchestrator operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "carhold_operation_duration_seconds";

/// Counter: holds placed.
pub const HOLDS_PLACED_TOTAL: &str = "carhold_holds_placed_total";

/// Counter: holds removed. Labels: reason.
pub const HOLDS_RELEASED_TOTAL: &str = "carhold_holds_released_total";

/// Counter: bookings created. Labels: payment.
pub const BOOKINGS_CREATED_TOTAL: &str = "carhold_bookings_created_total";

/// Counter: writes refused because the dates were taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "carhold_booking_conflicts_total";

/// Counter: booking status transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "carhold_booking_transitions_total";

/// Counter: gateway refunds. Labels: outcome.
pub const REFUNDS_TOTAL: &str = "carhold_refunds_total";

/// Counter: abandoned unpaid bookings removed by the sweeper.
pub const STALE_BOOKINGS_CLEARED_TOTAL: &str = "carhold_stale_bookings_cleared_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: registered cars.
pub const CARS_REGISTERED: &str = "carhold_cars_registered";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "carhold_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "carhold_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "carhold_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Outcome label for a result.
pub fn status_label<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() { "ok" } else { "error" }
}
