use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "cohort_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "cohort_request_duration_seconds";

/// Counter: create/update requests rejected because the owner was already booked.
pub const SCHEDULE_CONFLICTS_TOTAL: &str = "cohort_schedule_conflicts_total";

/// Counter: notifications the notifier failed to deliver.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "cohort_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "cohort_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "cohort_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "cohort_connections_rejected_total";

/// Counter: connections dropped for a missing or malformed hello.
pub const HANDSHAKE_FAILURES_TOTAL: &str = "cohort_handshake_failures_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "cohort_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "cohort_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "cohort_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "cohort_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, used as the `op` metrics label.
pub fn request_label(request: &Request) -> &'static str {
    match request {
        Request::RegisterActor { .. } => "register_actor",
        Request::CreateGroup { .. } => "create_group",
        Request::JoinGroup { .. } => "join_group",
        Request::LeaveGroup { .. } => "leave_group",
        Request::SetGrants { .. } => "set_grants",
        Request::ArchiveGroup { .. } => "archive_group",
        Request::DeleteGroup { .. } => "delete_group",
        Request::GetGroup { .. } => "get_group",
        Request::CreateSchedule { .. } => "create_schedule",
        Request::CreateGroupSchedule { .. } => "create_group_schedule",
        Request::UpdateSchedule { .. } => "update_schedule",
        Request::DeleteSchedule { .. } => "delete_schedule",
        Request::ListSchedules { .. } => "list_schedules",
        Request::GroupSchedule { .. } => "group_schedule",
        Request::Listen => "listen",
    }
}
