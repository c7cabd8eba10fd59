use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::overlaps;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Stable id of an already-authenticated caller.
pub type ActorId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    /// Same duration, moved by `delta` ms.
    pub fn shifted(&self, delta: Ms) -> Span {
        Span::new(self.start + delta, self.end + delta)
    }
}

/// Named permission over a group's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AddEvent,
    EditEvent,
    DeleteEvent,
}

impl Capability {
    pub fn label(self) -> &'static str {
        match self {
            Capability::AddEvent => "add schedule event",
            Capability::EditEvent => "edit schedule event",
            Capability::DeleteEvent => "delete schedule event",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Capabilities granted to every non-owner member of a group at once.
/// There is no per-member override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrants {
    #[serde(default)]
    pub add_event: bool,
    #[serde(default)]
    pub edit_event: bool,
    #[serde(default)]
    pub delete_event: bool,
}

impl CapabilityGrants {
    pub fn all() -> Self {
        Self {
            add_event: true,
            edit_event: true,
            delete_event: true,
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::AddEvent => self.add_event,
            Capability::EditEvent => self.edit_event,
            Capability::DeleteEvent => self.delete_event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: Ulid,
    pub name: String,
    pub owner: ActorId,
    pub archived: bool,
    /// `#rrggbb`, assigned at creation.
    pub color: String,
    pub grants: CapabilityGrants,
    /// Joined members, owner excluded.
    pub members: Vec<ActorId>,
}

impl Group {
    pub fn is_owner(&self, actor: ActorId) -> bool {
        self.owner == actor
    }

    pub fn is_member(&self, actor: ActorId) -> bool {
        self.members.contains(&actor)
    }

    /// Owner or joined member.
    pub fn is_participant(&self, actor: ActorId) -> bool {
        self.is_owner(actor) || self.is_member(actor)
    }

    /// Everyone who hears about schedule changes, minus `exclude`.
    pub fn audience(&self, exclude: ActorId) -> Vec<ActorId> {
        let mut out: Vec<ActorId> = self
            .members
            .iter()
            .copied()
            .filter(|m| *m != exclude)
            .collect();
        if self.owner != exclude {
            out.push(self.owner);
        }
        out
    }
}

/// One persisted schedule row, attached to exactly one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: Ulid,
    pub group_id: Ulid,
    pub title: String,
    pub span: Span,
    /// Member who created it; not necessarily the group owner.
    pub creator: ActorId,
    /// Id of the first instance when part of a weekly series.
    pub series_id: Option<Ulid>,
    /// Additional weekly occurrences requested alongside the first.
    pub repeat_count: u32,
}

/// Which rows an update or delete touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Occurrence,
    Series,
}

/// Everything an owner is responsible for: their groups and every event
/// attached to them. This is the unit of locking for conflict-check-then-write.
#[derive(Debug, Clone)]
pub struct OwnerCalendar {
    pub owner: ActorId,
    pub groups: Vec<Group>,
    /// Sorted by `span.start`.
    pub events: Vec<ScheduledEvent>,
}

impl OwnerCalendar {
    pub fn new(owner: ActorId) -> Self {
        Self {
            owner,
            groups: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn group(&self, id: &Ulid) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == *id)
    }

    pub fn group_mut(&mut self, id: &Ulid) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.id == *id)
    }

    pub fn event(&self, id: &Ulid) -> Option<&ScheduledEvent> {
        self.events.iter().find(|e| e.id == *id)
    }

    /// Insert event maintaining sort order by span.start.
    pub fn insert_event(&mut self, event: ScheduledEvent) {
        let pos = self
            .events
            .partition_point(|e| e.span.start <= event.span.start);
        self.events.insert(pos, event);
    }

    pub fn remove_event(&mut self, id: &Ulid) -> Option<ScheduledEvent> {
        let pos = self.events.iter().position(|e| e.id == *id)?;
        Some(self.events.remove(pos))
    }

    /// Return only events whose span overlaps the query window.
    /// Uses binary search to skip events starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ScheduledEvent> {
        let right_bound = self.events.partition_point(|e| e.span.start < query.end);
        self.events[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }

    pub fn events_in_group(&self, group_id: &Ulid) -> impl Iterator<Item = &ScheduledEvent> {
        let group_id = *group_id;
        self.events.iter().filter(move |e| e.group_id == group_id)
    }

    /// Every row of a series, in start order.
    pub fn series(&self, series_id: &Ulid) -> Vec<ScheduledEvent> {
        self.events
            .iter()
            .filter(|e| e.series_id.as_ref() == Some(series_id))
            .cloned()
            .collect()
    }

    pub fn active_group_ids(&self) -> Vec<Ulid> {
        self.groups
            .iter()
            .filter(|g| !g.archived)
            .map(|g| g.id)
            .collect()
    }

    /// The owner aggregate calendar: events of every non-archived owned group.
    pub fn aggregate(&self) -> Vec<ScheduledEvent> {
        let active = self.active_group_ids();
        self.events
            .iter()
            .filter(|e| active.contains(&e.group_id))
            .cloned()
            .collect()
    }
}

/// Explicit list of everything removed when a group is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionPlan {
    pub group_id: Ulid,
    pub owner: ActorId,
    pub event_ids: Vec<Ulid>,
    pub members: Vec<ActorId>,
}

/// WAL record format. Each record is applied atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    ActorRegistered {
        id: ActorId,
        display_name: String,
    },
    /// Also used for snapshots, so `group` may already carry members and grants.
    GroupCreated {
        group: Group,
    },
    GrantsUpdated {
        group_id: Ulid,
        owner: ActorId,
        grants: CapabilityGrants,
    },
    GroupArchived {
        group_id: Ulid,
        owner: ActorId,
    },
    MemberJoined {
        group_id: Ulid,
        owner: ActorId,
        actor: ActorId,
    },
    MemberLeft {
        group_id: Ulid,
        owner: ActorId,
        actor: ActorId,
    },
    GroupDeleted {
        plan: DeletionPlan,
    },
    /// All rows of one create request, every group and every instance.
    EventsScheduled {
        owners: Vec<ActorId>,
        events: Vec<ScheduledEvent>,
    },
    EventsUpdated {
        owners: Vec<ActorId>,
        events: Vec<ScheduledEvent>,
    },
    EventsDeleted {
        owners: Vec<ActorId>,
        ids: Vec<Ulid>,
    },
}

impl Record {
    /// Calendars this record touches. Empty for actor-level records.
    pub fn owners(&self) -> Vec<ActorId> {
        match self {
            Record::ActorRegistered { .. } => Vec::new(),
            Record::GroupCreated { group } => vec![group.owner],
            Record::GrantsUpdated { owner, .. }
            | Record::GroupArchived { owner, .. }
            | Record::MemberJoined { owner, .. }
            | Record::MemberLeft { owner, .. } => vec![*owner],
            Record::GroupDeleted { plan } => vec![plan.owner],
            Record::EventsScheduled { owners, .. }
            | Record::EventsUpdated { owners, .. }
            | Record::EventsDeleted { owners, .. } => owners.clone(),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub group_ids: Vec<Ulid>,
    pub title: String,
    pub start: Ms,
    pub end: Ms,
    pub repeat_count: u32,
    pub notify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleChanges {
    pub title: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSeries {
    pub group_id: Ulid,
    /// `None` for a single occurrence.
    pub series_id: Option<Ulid>,
    pub event_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesDescriptor {
    pub title: String,
    pub span: Span,
    pub repeat_count: u32,
    pub groups: Vec<GroupSeries>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetail {
    #[serde(flatten)]
    pub event: ScheduledEvent,
    pub creator_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSchedule {
    pub group_id: Ulid,
    pub name: String,
    pub color: String,
    pub archived: bool,
    pub owner: ActorId,
    pub owner_name: Option<String>,
    pub owned_by_viewer: bool,
    pub events: Vec<EventDetail>,
}

/// Another owner's aggregate calendar, shown to explain blocked slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerCalendarView {
    pub owner: ActorId,
    pub owner_name: Option<String>,
    pub events: Vec<ScheduledEvent>,
    /// Merged, disjoint busy blocks.
    pub busy: Vec<Span>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorSchedule {
    pub groups: Vec<GroupSchedule>,
    pub owner_calendars: Vec<OwnerCalendarView>,
}
