use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (changes per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: admission outcomes. Labels: outcome (booked, slot_full, duplicate).
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Counter: successful cancellations.
pub const CANCELLATIONS_TOTAL: &str = "slotbook_cancellations_total";

/// Counter: slot counters rewritten by read-repair.
pub const COUNTER_REPAIRS_TOTAL: &str = "slotbook_counter_repairs_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEvent { .. } => "insert_event",
        Command::SelectEvents => "select_events",
        Command::SelectEvent { .. } => "select_event",
        Command::SelectEventsWithSlots => "select_events_with_slots",
        Command::UpdateEvent { .. } => "update_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::SelectTimeSlot { .. } => "select_time_slot",
        Command::SelectTimeSlots { .. } => "select_time_slots",
        Command::UpdateSlotCounter { .. } => "update_slot_counter",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookingsByEmail { .. } => "select_bookings_by_email",
        Command::SelectBookingsByEvent { .. } => "select_bookings_by_event",
        Command::DeleteBooking { .. } => "delete_booking",
    }
}
