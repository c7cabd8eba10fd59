use std::collections::{BTreeMap, HashSet};

use ulid::Ulid;

use crate::model::*;

use super::{busy_blocks, Engine, SchedulingError};

impl Engine {
    // ── Group directory ──────────────────────────────────────

    pub async fn group(&self, group_id: &Ulid) -> Option<Group> {
        let owner = self.store.owner_of_group(group_id)?;
        let cal = self.store.calendar(&owner)?;
        let guard = cal.read().await;
        guard.group(group_id).cloned()
    }

    /// Ids of every group `owner` runs, archived ones included.
    pub async fn groups_owned_by(&self, owner: &ActorId) -> Vec<Ulid> {
        let Some(cal) = self.store.calendar(owner) else {
            return Vec::new();
        };
        let guard = cal.read().await;
        guard.groups.iter().map(|g| g.id).collect()
    }

    pub async fn event(&self, event_id: &Ulid) -> Option<ScheduledEvent> {
        let owner = self.store.owner_of_event(event_id)?;
        let cal = self.store.calendar(&owner)?;
        let guard = cal.read().await;
        guard.event(event_id).cloned()
    }

    pub fn display_name(&self, actor: &ActorId) -> Option<String> {
        self.store.display_name(actor)
    }

    // ── Schedules ────────────────────────────────────────────

    /// Every event of one group. Owner or joined member only.
    pub async fn list_for_group(
        &self,
        actor: ActorId,
        group_id: Ulid,
    ) -> Result<GroupSchedule, SchedulingError> {
        let owner = self
            .store
            .owner_of_group(&group_id)
            .ok_or(SchedulingError::NotFound(group_id))?;
        let cal = self
            .store
            .calendar(&owner)
            .ok_or(SchedulingError::NotFound(group_id))?;
        let guard = cal.read().await;
        let group = guard
            .group(&group_id)
            .ok_or(SchedulingError::NotFound(group_id))?;
        if !group.is_participant(actor) {
            return Err(SchedulingError::Forbidden {
                group_id,
                group_name: group.name.clone(),
                action: "view group schedule",
            });
        }
        Ok(self.group_schedule(actor, &guard, group))
    }

    /// Schedules of every live group the actor owns or has joined, sorted by
    /// group name. With a filter, only those groups are returned (an empty
    /// filter returns nothing), and each in-scope owner other than the actor
    /// contributes their aggregate calendar.
    pub async fn list_for_actor(
        &self,
        actor: ActorId,
        filter: Option<Vec<Ulid>>,
    ) -> ActorSchedule {
        if filter.as_ref().is_some_and(|f| f.is_empty()) {
            return ActorSchedule::default();
        }
        let wanted: Option<HashSet<Ulid>> = filter.map(|f| f.into_iter().collect());

        let mut candidates = self.groups_owned_by(&actor).await;
        candidates.extend(self.store.joined_groups(&actor));
        if let Some(wanted) = &wanted {
            candidates.retain(|g| wanted.contains(g));
        }

        // One read lock per owner keeps each owner's view consistent.
        let mut by_owner: BTreeMap<ActorId, HashSet<Ulid>> = BTreeMap::new();
        for gid in candidates {
            if let Some(owner) = self.store.owner_of_group(&gid) {
                by_owner.entry(owner).or_default().insert(gid);
            }
        }

        let mut out = ActorSchedule::default();
        for (owner, gids) in by_owner {
            let Some(cal) = self.store.calendar(&owner) else {
                continue;
            };
            let guard = cal.read().await;
            let mut in_scope = false;
            for group in guard.groups.iter().filter(|g| gids.contains(&g.id)) {
                if group.archived || !group.is_participant(actor) {
                    continue;
                }
                in_scope = true;
                out.groups.push(self.group_schedule(actor, &guard, group));
            }
            if wanted.is_some() && in_scope && owner != actor {
                let events = guard.aggregate();
                out.owner_calendars.push(OwnerCalendarView {
                    owner,
                    owner_name: self.store.display_name(&owner),
                    busy: busy_blocks(&events),
                    events,
                });
            }
        }

        out.groups
            .sort_by(|a, b| a.name.cmp(&b.name).then(a.group_id.cmp(&b.group_id)));
        out
    }

    fn group_schedule(&self, viewer: ActorId, cal: &OwnerCalendar, group: &Group) -> GroupSchedule {
        let events = cal
            .events_in_group(&group.id)
            .map(|e| EventDetail {
                creator_name: self.store.display_name(&e.creator),
                event: e.clone(),
            })
            .collect();
        GroupSchedule {
            group_id: group.id,
            name: group.name.clone(),
            color: group.color.clone(),
            archived: group.archived,
            owner: group.owner,
            owner_name: self.store.display_name(&group.owner),
            owned_by_viewer: group.is_owner(viewer),
            events,
        }
    }
}
