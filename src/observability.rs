use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total HTTP requests. Labels: method, route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "clinicq_http_requests_total";

/// Histogram: request latency in seconds. Labels: method, route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "clinicq_http_request_duration_seconds";

// ── Reservation outcomes ────────────────────────────────────────

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "clinicq_reservations_created_total";

/// Counter: reservation writes refused by a consistency rule. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "clinicq_reservations_rejected_total";

/// Counter: applied status changes. Labels: to.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "clinicq_reservation_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent waiting for an engine lock, in seconds. Labels: lock.
pub const LOCK_WAIT_SECONDS: &str = "clinicq_lock_wait_seconds";

/// Counter: lock acquisitions that hit the timeout. Labels: lock.
pub const LOCK_TIMEOUTS_TOTAL: &str = "clinicq_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "clinicq_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "clinicq_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "clinicq_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Collapse a matched route template into a metrics label.
pub fn route_label(matched: Option<&str>) -> String {
    matched.unwrap_or("unmatched").to_string()
}
