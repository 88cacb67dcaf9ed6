use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "gymslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "gymslot_query_duration_seconds";

/// Counter: booking attempts that reached the trainer lock. Labels: outcome
/// (`created`, `conflict`, `out_of_hours`).
pub const BOOKINGS_TOTAL: &str = "gymslot_bookings_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "gymslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "gymslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "gymslot_connections_rejected_total";

/// Gauge: number of gyms with a loaded engine.
pub const TENANTS_ACTIVE: &str = "gymslot_tenants_active";

/// Counter: logins whose user name is neither the admin nor a known member.
pub const AUTH_FAILURES_TOTAL: &str = "gymslot_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gymslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gymslot_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::PutTrainer { .. } => "put_trainer",
        Command::PutService { .. } => "put_service",
        Command::PutMember { .. } => "put_member",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::SetStatus { .. } => "set_status",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::SelectAppointments(_) => "select_appointments",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectAvailableTrainers { .. } => "select_available_trainers",
        Command::SelectStats => "select_stats",
        Command::SelectTrainers => "select_trainers",
        Command::SelectServices => "select_services",
        Command::SelectMembers => "select_members",
    }
}
