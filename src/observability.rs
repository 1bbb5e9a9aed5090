use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::model::BookingKind;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: occurrences written. Labels: kind.
pub const BOOKINGS_CREATED_TOTAL: &str = "salas_bookings_created_total";

/// Counter: batches rejected before any write. Labels: kind, reason.
pub const BATCHES_REJECTED_TOTAL: &str = "salas_batches_rejected_total";

/// Histogram: schedule call latency in seconds, rejected ones included. Labels: kind.
pub const BATCH_DURATION_SECONDS: &str = "salas_batch_duration_seconds";

/// Counter: rental state changes. Labels: to.
pub const STATE_CHANGES_TOTAL: &str = "salas_state_changes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: rooms loaded in the engine.
pub const ROOMS_ACTIVE: &str = "salas_rooms_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "salas_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "salas_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "salas_wal_compactions_total";

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

pub fn kind_label(kind: BookingKind) -> &'static str {
    match kind {
        BookingKind::Class => "class",
        BookingKind::Rental => "rental",
    }
}

/// Short label for why a call failed.
pub fn rejection_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::NotFound(_) => "not_found",
        EngineError::AlreadyExists(_) => "already_exists",
        EngineError::Conflict(_) => "conflict",
        EngineError::Validation(_) => "validation",
        EngineError::InvalidTransition { .. } => "invalid_transition",
        EngineError::HasBookings(_) => "has_bookings",
        EngineError::LimitExceeded(_) => "limit",
        EngineError::Storage(_) => "storage",
    }
}
