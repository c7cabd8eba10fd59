use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::recurrence::WEEK_MS;
use super::SchedulingError;

/// First owner event that a candidate instance runs into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Collision {
    pub instance: Span,
    pub existing: Ulid,
}

impl Collision {
    pub(crate) fn into_error(self, group: &Group) -> SchedulingError {
        SchedulingError::ScheduleConflict {
            group_id: group.id,
            group_name: group.name.clone(),
            start: self.instance.start,
            end: self.instance.end,
            existing: self.existing,
        }
    }
}

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, SchedulingError> {
    let span = Span::try_new(start, end)
        .ok_or_else(|| SchedulingError::invalid("start must be before end"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(SchedulingError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(SchedulingError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

pub(crate) fn validate_title(title: &str) -> Result<(), SchedulingError> {
    if title.trim().is_empty() {
        return Err(SchedulingError::invalid("title must not be empty"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(SchedulingError::LimitExceeded("title too long"));
    }
    Ok(())
}

/// A weekly series whose instances outlast the step would collide with itself.
pub(crate) fn validate_recurrence(span: &Span, repeat_count: u32) -> Result<(), SchedulingError> {
    if repeat_count > MAX_REPEAT_COUNT {
        return Err(SchedulingError::LimitExceeded("too many repeats"));
    }
    if repeat_count > 0 && span.duration_ms() > WEEK_MS {
        return Err(SchedulingError::invalid(
            "a weekly series cannot contain events longer than one week",
        ));
    }
    Ok(())
}

/// Instances of one series must not collide with each other. Expansion order
/// is start order, so neighbours are enough.
pub(crate) fn check_series_disjoint(instances: &[Span]) -> Result<(), SchedulingError> {
    if instances.windows(2).any(|w| w[0].overlaps(&w[1])) {
        return Err(SchedulingError::invalid("series instances overlap each other"));
    }
    Ok(())
}

/// Test every candidate instance against the owner's aggregate calendar:
/// events of all non-archived groups the owner runs. Events in `exclude`
/// are the ones being moved and never count against themselves.
pub(crate) fn check_owner_calendar(
    calendar: &OwnerCalendar,
    instances: &[Span],
    exclude: &HashSet<Ulid>,
) -> Result<(), Collision> {
    let active: HashSet<Ulid> = calendar.active_group_ids().into_iter().collect();
    for instance in instances {
        let hit = calendar
            .overlapping(instance)
            .find(|e| active.contains(&e.group_id) && !exclude.contains(&e.id));
        if let Some(existing) = hit {
            return Err(Collision {
                instance: *instance,
                existing: existing.id,
            });
        }
    }
    Ok(())
}
