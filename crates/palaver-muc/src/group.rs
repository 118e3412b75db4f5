//! Group membership resolution.
//!
//! Affiliation list entries may name a group instead of an individual user;
//! the engine expands those entries through a [`GroupResolver`] whenever it
//! derives an occupant's effective affiliation. Keeping the expansion behind
//! one capability query stops every call site from growing its own copy of
//! the group walk.

use std::collections::{HashMap, HashSet};

use jid::BareJid;

/// Directory lookup for group-addressed affiliation entries.
///
/// Implementations are expected to be in-memory caches of the user
/// directory; lookups happen under the room lock and must not block.
pub trait GroupResolver: Send + Sync {
    /// Whether the given JID names a group rather than an individual.
    fn is_group(&self, jid: &BareJid) -> bool;

    /// All individual members of a group; empty when unknown.
    fn members_of(&self, group: &BareJid) -> HashSet<BareJid>;

    /// All groups the given user belongs to.
    fn groups_of(&self, user: &BareJid) -> HashSet<BareJid>;
}

/// Resolver for deployments without shared groups.
#[derive(Debug, Default)]
pub struct NoGroups;

impl GroupResolver for NoGroups {
    fn is_group(&self, _jid: &BareJid) -> bool {
        false
    }

    fn members_of(&self, _group: &BareJid) -> HashSet<BareJid> {
        HashSet::new()
    }

    fn groups_of(&self, _user: &BareJid) -> HashSet<BareJid> {
        HashSet::new()
    }
}

/// Fixed group table, useful for tests and static deployments.
#[derive(Debug, Default)]
pub struct StaticGroups {
    groups: HashMap<BareJid, HashSet<BareJid>>,
}

impl StaticGroups {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group and its members, replacing any previous definition.
    pub fn insert(&mut self, group: BareJid, members: impl IntoIterator<Item = BareJid>) {
        self.groups.insert(group, members.into_iter().collect());
    }
}

impl GroupResolver for StaticGroups {
    fn is_group(&self, jid: &BareJid) -> bool {
        self.groups.contains_key(jid)
    }

    fn members_of(&self, group: &BareJid) -> HashSet<BareJid> {
        self.groups.get(group).cloned().unwrap_or_default()
    }

    fn groups_of(&self, user: &BareJid) -> HashSet<BareJid> {
        self.groups
            .iter()
            .filter(|(_, members)| members.contains(user))
            .map(|(group, _)| group.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    #[test]
    fn test_static_groups_membership() {
        let mut groups = StaticGroups::new();
        groups.insert(jid("staff@example.com"), [jid("alice@example.com")]);

        assert!(groups.is_group(&jid("staff@example.com")));
        assert!(!groups.is_group(&jid("alice@example.com")));
        assert!(groups
            .members_of(&jid("staff@example.com"))
            .contains(&jid("alice@example.com")));
        assert!(groups
            .groups_of(&jid("alice@example.com"))
            .contains(&jid("staff@example.com")));
        assert!(groups.groups_of(&jid("bob@example.com")).is_empty());
    }
}
