use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "peerlink_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "peerlink_query_duration_seconds";

// ── Domain outcomes ─────────────────────────────────────────────

/// Counter: bookings confirmed.
pub const BOOKINGS_TOTAL: &str = "peerlink_bookings_total";

/// Counter: bookings cancelled.
pub const CANCELLATIONS_TOTAL: &str = "peerlink_cancellations_total";

/// Counter: rejected engine operations. Labels: code.
pub const REJECTIONS_TOTAL: &str = "peerlink_rejections_total";

/// Counter: notifications the collaborator failed to deliver. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "peerlink_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "peerlink_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "peerlink_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "peerlink_connections_rejected_total";

/// Counter: sessions refused because the login is not a registered user.
pub const AUTH_FAILURES_TOTAL: &str = "peerlink_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "peerlink_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "peerlink_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterUser { .. } => "register_user",
        Command::CreateSlot { .. } => "create_slot",
        Command::ListAvailable { .. } => "list_available",
        Command::ListMySlots => "list_my_slots",
        Command::UpdateSlot { .. } => "update_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::Book { .. } => "book",
        Command::ListMyBookings => "list_my_bookings",
        Command::CancelBooking { .. } => "cancel_booking",
    }
}
