use crate::model::{ActorId, Capability, Group};

/// Answers "may this actor do this in this group". The engine resolves the
/// group record before asking, and always lets the owner through itself, so
/// an implementation only has to decide for everyone else.
pub trait PermissionGate: Send + Sync {
    fn has_capability(&self, actor: ActorId, group: &Group, capability: Capability) -> bool;
}

/// Default gate: capabilities are flags on the group, inherited by every joined
/// member. Non-members hold nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupGrants;

impl PermissionGate for GroupGrants {
    fn has_capability(&self, actor: ActorId, group: &Group, capability: Capability) -> bool {
        if group.is_owner(actor) {
            return true;
        }
        group.is_member(actor) && group.grants.allows(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CapabilityGrants;
    use ulid::Ulid;

    fn group(grants: CapabilityGrants, members: Vec<ActorId>) -> Group {
        Group {
            id: Ulid::new(),
            name: "robotics".into(),
            owner: Ulid::new(),
            archived: false,
            color: "#123456".into(),
            grants,
            members,
        }
    }

    #[test]
    fn owner_holds_everything_without_grants() {
        let g = group(CapabilityGrants::default(), vec![]);
        for cap in [Capability::AddEvent, Capability::EditEvent, Capability::DeleteEvent] {
            assert!(GroupGrants.has_capability(g.owner, &g, cap));
        }
    }

    #[test]
    fn members_share_group_grants() {
        let a = Ulid::new();
        let b = Ulid::new();
        let grants = CapabilityGrants {
            add_event: true,
            edit_event: false,
            delete_event: true,
        };
        let g = group(grants, vec![a, b]);
        for member in [a, b] {
            assert!(GroupGrants.has_capability(member, &g, Capability::AddEvent));
            assert!(!GroupGrants.has_capability(member, &g, Capability::EditEvent));
            assert!(GroupGrants.has_capability(member, &g, Capability::DeleteEvent));
        }
    }

    #[test]
    fn outsiders_hold_nothing() {
        let g = group(CapabilityGrants::all(), vec![]);
        assert!(!GroupGrants.has_capability(Ulid::new(), &g, Capability::AddEvent));
    }
}
