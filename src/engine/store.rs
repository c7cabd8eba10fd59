use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedCalendar;

/// Owner calendars plus the lookup indexes that point into them.
/// Indexes are only touched from `apply_record`, under the owning calendar's write lock.
pub struct CalendarStore {
    calendars: DashMap<ActorId, SharedCalendar>,
    /// group id → owner
    group_owner: DashMap<Ulid, ActorId>,
    /// event id → owner
    event_owner: DashMap<Ulid, ActorId>,
    /// member → groups joined (owned groups excluded)
    memberships: DashMap<ActorId, Vec<Ulid>>,
    display_names: DashMap<ActorId, String>,
    /// colour → group using it, across every owner
    colors: DashMap<String, Ulid>,
}

impl Default for CalendarStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CalendarStore {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            group_owner: DashMap::new(),
            event_owner: DashMap::new(),
            memberships: DashMap::new(),
            display_names: DashMap::new(),
            colors: DashMap::new(),
        }
    }

    // ── Calendars ────────────────────────────────────────────

    pub fn calendar(&self, owner: &ActorId) -> Option<SharedCalendar> {
        self.calendars.get(owner).map(|e| e.value().clone())
    }

    pub fn calendar_or_insert(&self, owner: ActorId) -> SharedCalendar {
        self.calendars
            .entry(owner)
            .or_insert_with(|| Arc::new(RwLock::new(OwnerCalendar::new(owner))))
            .value()
            .clone()
    }

    pub fn owners(&self) -> Vec<ActorId> {
        let mut owners: Vec<ActorId> = self.calendars.iter().map(|e| *e.key()).collect();
        owners.sort();
        owners
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn owner_of_group(&self, group_id: &Ulid) -> Option<ActorId> {
        self.group_owner.get(group_id).map(|e| *e.value())
    }

    pub fn owner_of_event(&self, event_id: &Ulid) -> Option<ActorId> {
        self.event_owner.get(event_id).map(|e| *e.value())
    }

    pub fn joined_groups(&self, actor: &ActorId) -> Vec<Ulid> {
        self.memberships
            .get(actor)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn add_membership(&self, actor: ActorId, group_id: Ulid) {
        let mut groups = self.memberships.entry(actor).or_default();
        if !groups.contains(&group_id) {
            groups.push(group_id);
        }
    }

    fn remove_membership(&self, actor: &ActorId, group_id: &Ulid) {
        if let Some(mut groups) = self.memberships.get_mut(actor) {
            groups.retain(|g| g != group_id);
        }
    }

    /// Reserve `color` for `group_id`. False if another group holds it.
    pub fn claim_color(&self, color: &str, group_id: Ulid) -> bool {
        match self.colors.entry(color.to_string()) {
            Entry::Occupied(o) => *o.get() == group_id,
            Entry::Vacant(v) => {
                v.insert(group_id);
                true
            }
        }
    }

    pub fn release_color(&self, color: &str, group_id: &Ulid) {
        self.colors.remove_if(color, |_, holder| holder == group_id);
    }

    // ── Actors ───────────────────────────────────────────────

    pub fn display_name(&self, actor: &ActorId) -> Option<String> {
        self.display_names.get(actor).map(|e| e.value().clone())
    }

    pub fn actors(&self) -> Vec<(ActorId, String)> {
        self.display_names
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    // ── Record application ───────────────────────────────────

    /// Apply the parts of `record` that concern actors rather than calendars.
    pub fn apply_global(&self, record: &Record) {
        if let Record::ActorRegistered { id, display_name } = record {
            self.display_names.insert(*id, display_name.clone());
        }
    }

    /// Apply a record to one owner's calendar (caller holds the lock).
    /// Multi-owner records are applied once per owner; each call only takes
    /// the rows that belong to `cal`'s groups.
    pub fn apply_record(&self, cal: &mut OwnerCalendar, record: &Record) {
        match record {
            Record::ActorRegistered { .. } => {}
            Record::GroupCreated { group } => {
                if group.owner != cal.owner || cal.group(&group.id).is_some() {
                    return;
                }
                self.group_owner.insert(group.id, group.owner);
                self.colors.entry(group.color.clone()).or_insert(group.id);
                for member in &group.members {
                    self.add_membership(*member, group.id);
                }
                cal.groups.push(group.clone());
            }
            Record::GrantsUpdated { group_id, grants, .. } => {
                if let Some(g) = cal.group_mut(group_id) {
                    g.grants = *grants;
                }
            }
            Record::GroupArchived { group_id, .. } => {
                if let Some(g) = cal.group_mut(group_id) {
                    g.archived = true;
                }
            }
            Record::MemberJoined { group_id, actor, .. } => {
                if let Some(g) = cal.group_mut(group_id)
                    && !g.members.contains(actor) {
                        g.members.push(*actor);
                        self.add_membership(*actor, *group_id);
                    }
            }
            Record::MemberLeft { group_id, actor, .. } => {
                if let Some(g) = cal.group_mut(group_id) {
                    g.members.retain(|m| m != actor);
                    self.remove_membership(actor, group_id);
                }
            }
            Record::GroupDeleted { plan } => {
                for id in &plan.event_ids {
                    if cal.remove_event(id).is_some() {
                        self.event_owner.remove(id);
                    }
                }
                for member in &plan.members {
                    self.remove_membership(member, &plan.group_id);
                }
                if let Some(g) = cal.group(&plan.group_id) {
                    self.release_color(&g.color, &g.id);
                }
                cal.groups.retain(|g| g.id != plan.group_id);
                self.group_owner.remove(&plan.group_id);
            }
            Record::EventsScheduled { events, .. } => {
                for event in events {
                    if cal.group(&event.group_id).is_some() {
                        self.event_owner.insert(event.id, cal.owner);
                        cal.insert_event(event.clone());
                    }
                }
            }
            Record::EventsUpdated { events, .. } => {
                for event in events {
                    if cal.remove_event(&event.id).is_some() {
                        cal.insert_event(event.clone());
                    }
                }
            }
            Record::EventsDeleted { ids, .. } => {
                for id in ids {
                    if cal.remove_event(id).is_some() {
                        self.event_owner.remove(id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(owner: ActorId) -> Group {
        Group {
            id: Ulid::new(),
            name: "chem".into(),
            owner,
            archived: false,
            color: "#010203".into(),
            grants: CapabilityGrants::default(),
            members: Vec::new(),
        }
    }

    fn event(group_id: Ulid, start: Ms) -> ScheduledEvent {
        ScheduledEvent {
            id: Ulid::new(),
            group_id,
            title: "seminar".into(),
            span: Span::new(start, start + 100),
            creator: Ulid::new(),
            series_id: None,
            repeat_count: 0,
        }
    }

    #[tokio::test]
    async fn multi_owner_record_splits_by_calendar() {
        let store = CalendarStore::new();
        let (o1, o2) = (Ulid::new(), Ulid::new());
        let (g1, g2) = (group(o1), group(o2));

        let c1 = store.calendar_or_insert(o1);
        let c2 = store.calendar_or_insert(o2);
        let mut w1 = c1.write().await;
        let mut w2 = c2.write().await;
        store.apply_record(&mut w1, &Record::GroupCreated { group: g1.clone() });
        store.apply_record(&mut w2, &Record::GroupCreated { group: g2.clone() });

        let e1 = event(g1.id, 1000);
        let e2 = event(g2.id, 1000);
        let record = Record::EventsScheduled {
            owners: vec![o1, o2],
            events: vec![e1.clone(), e2.clone()],
        };
        store.apply_record(&mut w1, &record);
        store.apply_record(&mut w2, &record);

        assert_eq!(w1.events, vec![e1.clone()]);
        assert_eq!(w2.events, vec![e2.clone()]);
        assert_eq!(store.owner_of_event(&e1.id), Some(o1));
        assert_eq!(store.owner_of_event(&e2.id), Some(o2));
    }

    #[tokio::test]
    async fn membership_index_follows_records() {
        let store = CalendarStore::new();
        let owner = Ulid::new();
        let member = Ulid::new();
        let g = group(owner);
        let cal = store.calendar_or_insert(owner);
        let mut w = cal.write().await;

        store.apply_record(&mut w, &Record::GroupCreated { group: g.clone() });
        store.apply_record(
            &mut w,
            &Record::MemberJoined { group_id: g.id, owner, actor: member },
        );
        assert_eq!(store.joined_groups(&member), vec![g.id]);

        store.apply_record(
            &mut w,
            &Record::MemberLeft { group_id: g.id, owner, actor: member },
        );
        assert!(store.joined_groups(&member).is_empty());
        assert!(w.groups[0].members.is_empty());
    }

    #[tokio::test]
    async fn group_deletion_clears_indexes() {
        let store = CalendarStore::new();
        let owner = Ulid::new();
        let member = Ulid::new();
        let mut g = group(owner);
        g.members.push(member);
        let cal = store.calendar_or_insert(owner);
        let mut w = cal.write().await;
        store.apply_record(&mut w, &Record::GroupCreated { group: g.clone() });
        let e = event(g.id, 5000);
        store.apply_record(
            &mut w,
            &Record::EventsScheduled { owners: vec![owner], events: vec![e.clone()] },
        );

        let plan = DeletionPlan {
            group_id: g.id,
            owner,
            event_ids: vec![e.id],
            members: vec![member],
        };
        store.apply_record(&mut w, &Record::GroupDeleted { plan });

        assert!(w.groups.is_empty());
        assert!(w.events.is_empty());
        assert_eq!(store.owner_of_group(&g.id), None);
        assert_eq!(store.owner_of_event(&e.id), None);
        assert!(store.joined_groups(&member).is_empty());
    }

    #[tokio::test]
    async fn colours_are_held_until_the_group_goes() {
        let store = CalendarStore::new();
        let owner = Ulid::new();
        let g = group(owner);
        let other = Ulid::new();
        assert!(store.claim_color("#0a0b0c", other));
        assert!(store.claim_color("#0a0b0c", other));

        let cal = store.calendar_or_insert(owner);
        let mut w = cal.write().await;
        store.apply_record(&mut w, &Record::GroupCreated { group: g.clone() });
        assert!(!store.claim_color(&g.color, other));
        assert!(store.claim_color(&g.color, g.id));

        // Only the holder can release.
        store.release_color(&g.color, &other);
        assert!(!store.claim_color(&g.color, other));

        let plan = DeletionPlan { group_id: g.id, owner, event_ids: vec![], members: vec![] };
        store.apply_record(&mut w, &Record::GroupDeleted { plan });
        assert!(store.claim_color(&g.color, other));
    }

    #[test]
    fn display_names_from_global_records() {
        let store = CalendarStore::new();
        let id = Ulid::new();
        store.apply_global(&Record::ActorRegistered { id, display_name: "Grace".into() });
        assert_eq!(store.display_name(&id).as_deref(), Some("Grace"));
        assert_eq!(store.actors().len(), 1);
    }
}
