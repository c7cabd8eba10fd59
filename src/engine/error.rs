use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

/// Everything a scheduling call can fail with. Every variant is raised before
/// the commit point, so no partial state is ever visible after an error.
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not permitted to {action} in group {group_name} ({group_id})")]
    Forbidden {
        group_id: Ulid,
        group_name: String,
        action: &'static str,
    },
    #[error("group {group_name} ({group_id}) is archived")]
    GroupArchived { group_id: Ulid, group_name: String },
    #[error("schedule overlaps in group {group_name}: [{start}, {end}) collides with event {existing}")]
    ScheduleConflict {
        group_id: Ulid,
        group_name: String,
        start: Ms,
        end: Ms,
        existing: Ulid,
    },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl SchedulingError {
    /// Stable machine-readable tag, used on the wire and as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingError::Validation(_) => "validation",
            SchedulingError::Forbidden { .. } => "forbidden",
            SchedulingError::GroupArchived { .. } => "group_archived",
            SchedulingError::ScheduleConflict { .. } => "schedule_conflict",
            SchedulingError::NotFound(_) => "not_found",
            SchedulingError::LimitExceeded(_) => "limit_exceeded",
            SchedulingError::Persistence(_) => "persistence",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SchedulingError::Validation(msg.into())
    }
}
