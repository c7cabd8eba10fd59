use std::collections::{BTreeMap, HashSet};

use chrono::DateTime;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;

use super::conflict::{
    check_owner_calendar, check_series_disjoint, validate_recurrence, validate_span, validate_title,
};
use super::{expand_weekly, CalendarGuard, Engine, SchedulingError, WalCommand};

impl Engine {
    /// Create one weekly series in every listed group. All-or-nothing: a
    /// missing grant, an archived group, or an owner conflict in any target
    /// group rejects the whole request and nothing is written.
    pub async fn create_for_groups(
        &self,
        actor: ActorId,
        request: NewSchedule,
    ) -> Result<SeriesDescriptor, SchedulingError> {
        let NewSchedule {
            group_ids,
            title,
            start,
            end,
            repeat_count,
            notify,
        } = request;

        validate_title(&title)?;
        let seed = validate_span(start, end)?;
        validate_recurrence(&seed, repeat_count)?;
        let group_ids = dedup_in_order(group_ids);
        if group_ids.is_empty() {
            return Err(SchedulingError::invalid("at least one group is required"));
        }
        if group_ids.len() > MAX_GROUPS_PER_REQUEST {
            return Err(SchedulingError::LimitExceeded("too many groups in one request"));
        }

        let instances = expand_weekly(seed, repeat_count);
        check_series_disjoint(&instances)?;

        let _commit = self.commit_gate.read().await;
        let mut owners = Vec::with_capacity(group_ids.len());
        for gid in &group_ids {
            owners.push(self.store.owner_of_group(gid).ok_or_else(|| unknown_group(gid))?);
        }
        let mut guards = self.lock_calendars(&owners).await?;

        // Phase 1: every group exists, is live, and lets the actor add events.
        let mut targets: Vec<Group> = Vec::with_capacity(group_ids.len());
        for (gid, owner) in group_ids.iter().zip(&owners) {
            let group = guards
                .get(owner)
                .and_then(|cal| cal.group(gid))
                .cloned()
                .ok_or_else(|| unknown_group(gid))?;
            if group.archived {
                return Err(SchedulingError::GroupArchived {
                    group_id: group.id,
                    group_name: group.name,
                });
            }
            self.authorize(actor, &group, Capability::AddEvent)?;
            targets.push(group);
        }

        for (owner, cal) in &guards {
            let incoming = targets.iter().filter(|g| g.owner == *owner).count() * instances.len();
            if cal.events.len() + incoming > MAX_EVENTS_PER_OWNER {
                return Err(SchedulingError::LimitExceeded("too many events for group owner"));
            }
        }

        // Phase 2: the whole series against each owner's aggregate calendar.
        for group in &targets {
            if let Err(collision) = check_owner_calendar(&guards[&group.owner], &instances, &HashSet::new()) {
                metrics::counter!(crate::observability::SCHEDULE_CONFLICTS_TOTAL).increment(1);
                debug!(group = %group.id, existing = %collision.existing, "create rejected: owner double-booked");
                return Err(collision.into_error(group));
            }
        }

        // Phase 3: one record for every group and every instance.
        let mut events = Vec::with_capacity(targets.len() * instances.len());
        let mut groups = Vec::with_capacity(targets.len());
        for group in &targets {
            let ids: Vec<Ulid> = instances.iter().map(|_| self.ids.next_id()).collect();
            let series_id = ids.first().copied().filter(|_| repeat_count > 0);
            for (id, span) in ids.iter().zip(&instances) {
                events.push(ScheduledEvent {
                    id: *id,
                    group_id: group.id,
                    title: title.clone(),
                    span: *span,
                    creator: actor,
                    series_id,
                    repeat_count,
                });
            }
            groups.push(GroupSeries {
                group_id: group.id,
                series_id,
                event_ids: ids,
            });
        }

        let record = Record::EventsScheduled {
            owners: guards.keys().copied().collect(),
            events,
        };
        self.commit(&record, &mut guards).await?;
        drop(guards);
        info!(%actor, groups = targets.len(), instances = instances.len(), "schedule created");

        if notify {
            let initiator = self
                .store
                .display_name(&actor)
                .unwrap_or_else(|| actor.to_string());
            let notices = targets
                .iter()
                .map(|g| creation_notice(g, actor, &initiator, &title, seed))
                .collect();
            self.dispatch(notices);
        }

        Ok(SeriesDescriptor {
            title,
            span: seed,
            repeat_count,
            groups,
        })
    }

    /// Single-group form of [`Engine::create_for_groups`].
    pub async fn create_for_group(
        &self,
        actor: ActorId,
        group_id: Ulid,
        title: String,
        span: Span,
        repeat_count: u32,
        notify: bool,
    ) -> Result<SeriesDescriptor, SchedulingError> {
        self.create_for_groups(
            actor,
            NewSchedule {
                group_ids: vec![group_id],
                title,
                start: span.start,
                end: span.end,
                repeat_count,
                notify,
            },
        )
        .await
    }

    /// Move and/or retitle one occurrence, or a whole series. For a series the
    /// target takes the new span, every sibling is shifted by the same start
    /// delta and takes the new duration, and a new title applies to all.
    pub async fn update_schedule(
        &self,
        actor: ActorId,
        event_id: Ulid,
        changes: ScheduleChanges,
        scope: Scope,
    ) -> Result<Vec<ScheduledEvent>, SchedulingError> {
        if changes.title.is_none() && changes.start.is_none() && changes.end.is_none() {
            return Err(SchedulingError::invalid("nothing to update"));
        }
        if let Some(title) = &changes.title {
            validate_title(title)?;
        }

        let _commit = self.commit_gate.read().await;
        let (owner, mut guards) = self.lock_event(&event_id).await?;
        let cal = &guards[&owner];
        let target = cal
            .event(&event_id)
            .cloned()
            .ok_or(SchedulingError::NotFound(event_id))?;
        let group = self.writable_group(actor, cal, &target, Capability::EditEvent)?;

        let moved = validate_span(
            changes.start.unwrap_or(target.span.start),
            changes.end.unwrap_or(target.span.end),
        )?;
        let rows = affected_rows(cal, &target, scope);
        if rows.len() > 1 {
            validate_recurrence(&moved, (rows.len() - 1) as u32)?;
        }

        let delta = moved.start - target.span.start;
        let duration = moved.duration_ms();
        let mut updated = Vec::with_capacity(rows.len());
        for row in &rows {
            let start = row.span.start + delta;
            updated.push(ScheduledEvent {
                title: changes.title.clone().unwrap_or_else(|| row.title.clone()),
                span: validate_span(start, start + duration)?,
                ..row.clone()
            });
        }

        let spans: Vec<Span> = updated.iter().map(|e| e.span).collect();
        check_series_disjoint(&spans)?;
        let moving: HashSet<Ulid> = rows.iter().map(|e| e.id).collect();
        if let Err(collision) = check_owner_calendar(cal, &spans, &moving) {
            metrics::counter!(crate::observability::SCHEDULE_CONFLICTS_TOTAL).increment(1);
            debug!(%event_id, existing = %collision.existing, "update rejected: owner double-booked");
            return Err(collision.into_error(&group));
        }

        let record = Record::EventsUpdated {
            owners: vec![owner],
            events: updated.clone(),
        };
        self.commit(&record, &mut guards).await?;
        info!(%actor, %event_id, rows = updated.len(), "schedule updated");
        Ok(updated)
    }

    /// Delete one occurrence or every row of its series. Returns the removed ids.
    pub async fn delete_schedule(
        &self,
        actor: ActorId,
        event_id: Ulid,
        scope: Scope,
    ) -> Result<Vec<Ulid>, SchedulingError> {
        let _commit = self.commit_gate.read().await;
        let (owner, mut guards) = self.lock_event(&event_id).await?;
        let cal = &guards[&owner];
        let target = cal
            .event(&event_id)
            .cloned()
            .ok_or(SchedulingError::NotFound(event_id))?;
        self.writable_group(actor, cal, &target, Capability::DeleteEvent)?;

        let ids: Vec<Ulid> = affected_rows(cal, &target, scope)
            .into_iter()
            .map(|e| e.id)
            .collect();
        let record = Record::EventsDeleted {
            owners: vec![owner],
            ids: ids.clone(),
        };
        self.commit(&record, &mut guards).await?;
        info!(%actor, %event_id, rows = ids.len(), "schedule deleted");
        Ok(ids)
    }

    async fn lock_event(
        &self,
        event_id: &Ulid,
    ) -> Result<(ActorId, BTreeMap<ActorId, CalendarGuard>), SchedulingError> {
        let owner = self
            .store
            .owner_of_event(event_id)
            .ok_or(SchedulingError::NotFound(*event_id))?;
        let guards = self.lock_calendars(&[owner]).await?;
        Ok((owner, guards))
    }

    fn writable_group(
        &self,
        actor: ActorId,
        cal: &OwnerCalendar,
        event: &ScheduledEvent,
        capability: Capability,
    ) -> Result<Group, SchedulingError> {
        let group = cal
            .group(&event.group_id)
            .ok_or(SchedulingError::NotFound(event.group_id))?;
        if group.archived {
            return Err(SchedulingError::GroupArchived {
                group_id: group.id,
                group_name: group.name.clone(),
            });
        }
        self.authorize(actor, group, capability)?;
        Ok(group.clone())
    }

    /// Compact the WAL by rewriting it with only the records needed to recreate the current state.
    /// Holds the commit gate exclusively, so no mutation lands between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), SchedulingError> {
        let _exclusive = self.commit_gate.write().await;

        let mut records: Vec<Record> = self
            .store
            .actors()
            .into_iter()
            .map(|(id, display_name)| Record::ActorRegistered { id, display_name })
            .collect();
        for owner in self.store.owners() {
            let Some(cal) = self.store.calendar(&owner) else {
                continue;
            };
            let guard = cal.read().await;
            records.extend(
                guard
                    .groups
                    .iter()
                    .map(|g| Record::GroupCreated { group: g.clone() }),
            );
            if !guard.events.is_empty() {
                records.push(Record::EventsScheduled {
                    owners: vec![owner],
                    events: guard.events.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| SchedulingError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::Persistence(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn affected_rows(cal: &OwnerCalendar, target: &ScheduledEvent, scope: Scope) -> Vec<ScheduledEvent> {
    match (scope, target.series_id) {
        (Scope::Series, Some(series_id)) => cal.series(&series_id),
        _ => vec![target.clone()],
    }
}

fn dedup_in_order(ids: Vec<Ulid>) -> Vec<Ulid> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

fn unknown_group(id: &Ulid) -> SchedulingError {
    SchedulingError::invalid(format!("unknown group {id}"))
}

fn creation_notice(
    group: &Group,
    actor: ActorId,
    initiator: &str,
    title: &str,
    span: Span,
) -> Notification {
    Notification {
        group_id: group.id,
        group_name: group.name.clone(),
        initiator: actor,
        recipients: group.audience(actor),
        subject: "A new schedule has been created!".into(),
        message: format!(
            "Schedule title '{title}' is set for {} to {} {} in collaboration group {} by {initiator}",
            format_ms(span.start, "%H:%M:%S"),
            format_ms(span.end, "%H:%M:%S"),
            format_ms(span.start, "%Y-%m-%d"),
            group.name,
        ),
    }
}

fn format_ms(ms: Ms, fmt: &str) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.format(fmt).to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let (a, b, c) = (Ulid::new(), Ulid::new(), Ulid::new());
        assert_eq!(dedup_in_order(vec![b, a, b, c, a]), vec![b, a, c]);
    }

    #[test]
    fn notice_text_and_audience() {
        let owner = Ulid::new();
        let member = Ulid::new();
        let group = Group {
            id: Ulid::new(),
            name: "Optics".into(),
            owner,
            archived: false,
            color: "#202020".into(),
            grants: CapabilityGrants::all(),
            members: vec![member],
        };
        // 2024-03-05 14:00:00Z .. 15:30:00Z
        let start = 1_709_647_200_000;
        let span = Span::new(start, start + 90 * 60 * 1000);
        let n = creation_notice(&group, member, "Lin", "Reading group", span);

        assert_eq!(n.recipients, vec![owner]);
        assert_eq!(n.subject, "A new schedule has been created!");
        assert_eq!(
            n.message,
            "Schedule title 'Reading group' is set for 14:00:00 to 15:30:00 2024-03-05 in collaboration group Optics by Lin"
        );
    }
}
