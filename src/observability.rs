use std::net::SocketAddr;

use crate::sql::Command;

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (`admitted` or an error kind).
pub const RESERVATIONS_TOTAL: &str = "chairbook_reservations_total";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "chairbook_cancellations_total";

/// Gauge: currently active reservations.
pub const ACTIVE_RESERVATIONS: &str = "chairbook_active_reservations";

/// Counter: notifications handed to the notifier. Labels: status.
pub const NOTIFICATIONS_TOTAL: &str = "chairbook_notifications_total";

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: SQL statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "chairbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "chairbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "chairbook_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chairbook_connections_total";

/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chairbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairbook_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairbook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "chairbook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op when `port` is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a parsed command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertReservation(_) => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectOccupied { .. } => "select_occupied",
        Command::SelectAvailable { .. } => "select_available",
        Command::SelectClientReservations { .. } => "select_client_reservations",
        Command::SelectReservation { .. } => "select_reservation",
    }
}
