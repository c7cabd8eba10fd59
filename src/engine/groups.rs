use std::collections::BTreeMap;

use tracing::info;
use ulid::Ulid;

use crate::ids::dark_color;
use crate::limits::*;
use crate::model::*;

use super::{CalendarGuard, Engine, SchedulingError};

/// Re-rolls before a new group settles for a colour already in use.
const COLOR_ATTEMPTS: u32 = 64;

/// Everything that disappears with a group: its events and its memberships.
pub fn deletion_plan(calendar: &OwnerCalendar, group: &Group) -> DeletionPlan {
    DeletionPlan {
        group_id: group.id,
        owner: calendar.owner,
        event_ids: calendar.events_in_group(&group.id).map(|e| e.id).collect(),
        members: group.members.clone(),
    }
}

fn validate_name(name: &str, what: &'static str) -> Result<(), SchedulingError> {
    if name.trim().is_empty() {
        return Err(SchedulingError::invalid(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SchedulingError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn owner_only(actor: ActorId, group: &Group) -> Result<(), SchedulingError> {
    if group.is_owner(actor) {
        return Ok(());
    }
    Err(SchedulingError::Forbidden {
        group_id: group.id,
        group_name: group.name.clone(),
        action: "manage group",
    })
}

fn live(group: &Group) -> Result<(), SchedulingError> {
    if group.archived {
        return Err(SchedulingError::GroupArchived {
            group_id: group.id,
            group_name: group.name.clone(),
        });
    }
    Ok(())
}

impl Engine {
    pub async fn register_actor(
        &self,
        actor: ActorId,
        display_name: String,
    ) -> Result<(), SchedulingError> {
        validate_name(&display_name, "display name")?;
        let _commit = self.commit_gate.read().await;
        let record = Record::ActorRegistered {
            id: actor,
            display_name,
        };
        self.wal_append(&record).await?;
        self.store.apply_global(&record);
        Ok(())
    }

    /// New group owned by `owner`, with a generated id and colour.
    pub async fn create_group(
        &self,
        owner: ActorId,
        name: String,
        grants: CapabilityGrants,
    ) -> Result<Group, SchedulingError> {
        validate_name(&name, "group name")?;
        let _commit = self.commit_gate.read().await;
        self.store.calendar_or_insert(owner);
        let mut guards = self.lock_calendars(&[owner]).await?;
        if guards.get(&owner).is_some_and(|cal| cal.groups.len() >= MAX_GROUPS_PER_OWNER) {
            return Err(SchedulingError::LimitExceeded("too many groups for owner"));
        }

        let id = self.ids.next_id();
        let color = self.pick_color(id);
        let group = Group {
            id,
            name,
            owner,
            archived: false,
            color,
            grants,
            members: Vec::new(),
        };
        let record = Record::GroupCreated {
            group: group.clone(),
        };
        if let Err(e) = self.commit(&record, &mut guards).await {
            self.store.release_color(&group.color, &id);
            return Err(e);
        }
        info!(%owner, group = %id, color = %group.color, "group created");
        Ok(group)
    }

    /// Join a live group. Joining twice, or joining your own group, is a no-op.
    pub async fn join_group(&self, actor: ActorId, group_id: Ulid) -> Result<Group, SchedulingError> {
        let _commit = self.commit_gate.read().await;
        let (owner, guard) = self.lock_group(&group_id).await?;
        let group = resolved(&guard, &group_id)?;
        live(&group)?;
        if group.is_participant(actor) {
            return Ok(group);
        }
        if group.members.len() >= MAX_MEMBERS_PER_GROUP {
            return Err(SchedulingError::LimitExceeded("too many members in group"));
        }

        let record = Record::MemberJoined {
            group_id,
            owner,
            actor,
        };
        let group = self.commit_one(owner, guard, &record, &group_id).await?;
        info!(%actor, group = %group_id, "member joined");
        Ok(group)
    }

    pub async fn leave_group(&self, actor: ActorId, group_id: Ulid) -> Result<(), SchedulingError> {
        let _commit = self.commit_gate.read().await;
        let (owner, guard) = self.lock_group(&group_id).await?;
        let group = resolved(&guard, &group_id)?;
        if group.is_owner(actor) {
            return Err(SchedulingError::invalid("the owner cannot leave their own group"));
        }
        if !group.is_member(actor) {
            return Err(SchedulingError::invalid("not a member of this group"));
        }

        let record = Record::MemberLeft {
            group_id,
            owner,
            actor,
        };
        self.commit_one(owner, guard, &record, &group_id).await?;
        info!(%actor, group = %group_id, "member left");
        Ok(())
    }

    /// Replace the capabilities every member inherits. Owner only.
    pub async fn set_grants(
        &self,
        actor: ActorId,
        group_id: Ulid,
        grants: CapabilityGrants,
    ) -> Result<Group, SchedulingError> {
        let _commit = self.commit_gate.read().await;
        let (owner, guard) = self.lock_group(&group_id).await?;
        let group = resolved(&guard, &group_id)?;
        owner_only(actor, &group)?;
        live(&group)?;

        let record = Record::GrantsUpdated {
            group_id,
            owner,
            grants,
        };
        self.commit_one(owner, guard, &record, &group_id).await
    }

    /// Archived groups stop counting toward their owner's calendar and
    /// accept no further schedule changes. There is no unarchive.
    pub async fn archive_group(&self, actor: ActorId, group_id: Ulid) -> Result<Group, SchedulingError> {
        let _commit = self.commit_gate.read().await;
        let (owner, guard) = self.lock_group(&group_id).await?;
        let group = resolved(&guard, &group_id)?;
        owner_only(actor, &group)?;
        live(&group)?;

        let record = Record::GroupArchived { group_id, owner };
        let group = self.commit_one(owner, guard, &record, &group_id).await?;
        info!(%actor, group = %group_id, "group archived");
        Ok(group)
    }

    /// Remove a group with all of its events and memberships as one record.
    /// Archived groups are kept as history and cannot be deleted.
    pub async fn delete_group(
        &self,
        actor: ActorId,
        group_id: Ulid,
    ) -> Result<DeletionPlan, SchedulingError> {
        let _commit = self.commit_gate.read().await;
        let (owner, guard) = self.lock_group(&group_id).await?;
        let group = resolved(&guard, &group_id)?;
        owner_only(actor, &group)?;
        live(&group)?;

        let plan = deletion_plan(&guard, &group);
        let record = Record::GroupDeleted { plan: plan.clone() };
        let mut guards: BTreeMap<ActorId, CalendarGuard> = [(owner, guard)].into_iter().collect();
        self.commit(&record, &mut guards).await?;
        info!(
            %actor,
            group = %group_id,
            events = plan.event_ids.len(),
            members = plan.members.len(),
            "group deleted"
        );
        Ok(plan)
    }

    /// First colour no other group in the tenant is using, reserved for `id`
    /// before the commit so two concurrent creates cannot both take it.
    /// Falls back to a shared colour once every re-roll is taken.
    fn pick_color(&self, id: Ulid) -> String {
        (0..COLOR_ATTEMPTS)
            .map(|attempt| dark_color(id, attempt))
            .find(|color| self.store.claim_color(color, id))
            .unwrap_or_else(|| dark_color(id, 0))
    }

    /// Commit against one locked calendar and hand back the group as it now stands.
    async fn commit_one(
        &self,
        owner: ActorId,
        guard: CalendarGuard,
        record: &Record,
        group_id: &Ulid,
    ) -> Result<Group, SchedulingError> {
        let mut guards: BTreeMap<ActorId, CalendarGuard> = [(owner, guard)].into_iter().collect();
        self.commit(record, &mut guards).await?;
        guards
            .get(&owner)
            .and_then(|cal| cal.group(group_id))
            .cloned()
            .ok_or(SchedulingError::NotFound(*group_id))
    }
}

fn resolved(cal: &OwnerCalendar, group_id: &Ulid) -> Result<Group, SchedulingError> {
    cal.group(group_id)
        .cloned()
        .ok_or(SchedulingError::NotFound(*group_id))
}
