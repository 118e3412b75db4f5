//! The four affiliation lists of a room.
//!
//! Entries are keyed by bare JID and may name either an individual or a
//! group; group entries are expanded through the [`GroupResolver`] at query
//! time. The lists are disjoint by construction: granting an affiliation
//! removes the JID from every other list in the same mutation.

use std::collections::{HashMap, HashSet};

use jid::BareJid;

use crate::group::GroupResolver;
use crate::types::Affiliation;

/// Reserved nicknames are compared and stored lowercase.
fn normalize_nick(nickname: &str) -> String {
    nickname.to_lowercase()
}

/// Owners, admins, members (with reserved nicknames), and outcasts.
#[derive(Debug, Default)]
pub struct Affiliations {
    owners: HashSet<BareJid>,
    admins: HashSet<BareJid>,
    members: HashMap<BareJid, String>,
    outcasts: HashSet<BareJid>,
}

impl Affiliations {
    /// Create empty lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the JID is in the given set directly or via a group entry.
    fn includes(set: &HashSet<BareJid>, jid: &BareJid, groups: &dyn GroupResolver) -> bool {
        set.contains(jid) || groups.groups_of(jid).iter().any(|group| set.contains(group))
    }

    /// Owner check, direct or via group.
    pub fn is_owner(&self, jid: &BareJid, groups: &dyn GroupResolver) -> bool {
        Self::includes(&self.owners, jid, groups)
    }

    /// Admin check, direct or via group.
    pub fn is_admin(&self, jid: &BareJid, groups: &dyn GroupResolver) -> bool {
        Self::includes(&self.admins, jid, groups)
    }

    /// Member check, direct or via group.
    pub fn is_member(&self, jid: &BareJid, groups: &dyn GroupResolver) -> bool {
        self.members.contains_key(jid)
            || groups
                .groups_of(jid)
                .iter()
                .any(|group| self.members.contains_key(group))
    }

    /// Outcast check, direct or via group.
    pub fn is_outcast(&self, jid: &BareJid, groups: &dyn GroupResolver) -> bool {
        Self::includes(&self.outcasts, jid, groups)
    }

    /// The affiliation recorded for this exact JID, ignoring groups.
    pub fn direct_affiliation(&self, jid: &BareJid) -> Affiliation {
        if self.owners.contains(jid) {
            Affiliation::Owner
        } else if self.admins.contains(jid) {
            Affiliation::Admin
        } else if self.outcasts.contains(jid) {
            Affiliation::Outcast
        } else if self.members.contains_key(jid) {
            Affiliation::Member
        } else {
            Affiliation::None
        }
    }

    /// The nickname reserved by a member, if any (empty string = none).
    pub fn reserved_nickname(&self, jid: &BareJid) -> Option<&str> {
        self.members
            .get(jid)
            .map(String::as_str)
            .filter(|nick| !nick.is_empty())
    }

    /// The member holding the given reserved nickname, if any.
    pub fn member_with_nickname(&self, nickname: &str) -> Option<&BareJid> {
        let wanted = normalize_nick(nickname);
        self.members
            .iter()
            .find(|(_, nick)| **nick == wanted)
            .map(|(jid, _)| jid)
    }

    /// Whether the JID is the only explicit owner.
    pub fn is_last_owner(&self, jid: &BareJid) -> bool {
        self.owners.len() == 1 && self.owners.contains(jid)
    }

    /// Whether any explicit owner exists.
    pub fn has_owner(&self) -> bool {
        !self.owners.is_empty()
    }

    /// Iterate the explicit owners.
    pub fn owners(&self) -> impl Iterator<Item = &BareJid> {
        self.owners.iter()
    }

    /// Iterate the explicit admins.
    pub fn admins(&self) -> impl Iterator<Item = &BareJid> {
        self.admins.iter()
    }

    /// Iterate the explicit members and their reserved nicknames.
    pub fn members(&self) -> impl Iterator<Item = (&BareJid, &str)> {
        self.members.iter().map(|(jid, nick)| (jid, nick.as_str()))
    }

    /// Iterate the explicit outcasts.
    pub fn outcasts(&self) -> impl Iterator<Item = &BareJid> {
        self.outcasts.iter()
    }

    /// Grant an affiliation, removing the JID from every other list.
    ///
    /// Returns the previous explicit affiliation. `nickname` is honored only
    /// for member grants.
    pub fn apply(
        &mut self,
        jid: &BareJid,
        affiliation: Affiliation,
        nickname: Option<&str>,
    ) -> Affiliation {
        let old = self.direct_affiliation(jid);
        self.owners.remove(jid);
        self.admins.remove(jid);
        self.members.remove(jid);
        self.outcasts.remove(jid);
        match affiliation {
            Affiliation::Owner => {
                self.owners.insert(jid.clone());
            }
            Affiliation::Admin => {
                self.admins.insert(jid.clone());
            }
            Affiliation::Member => {
                self.members
                    .insert(jid.clone(), normalize_nick(nickname.unwrap_or_default()));
            }
            Affiliation::Outcast => {
                self.outcasts.insert(jid.clone());
            }
            Affiliation::None => {}
        }
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{NoGroups, StaticGroups};

    fn jid(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    #[test]
    fn test_lists_are_disjoint() {
        let mut lists = Affiliations::new();
        let alice = jid("alice@example.com");
        lists.apply(&alice, Affiliation::Member, Some("Alice"));
        assert_eq!(lists.direct_affiliation(&alice), Affiliation::Member);

        let old = lists.apply(&alice, Affiliation::Admin, None);
        assert_eq!(old, Affiliation::Member);
        assert_eq!(lists.direct_affiliation(&alice), Affiliation::Admin);
        assert!(!lists.is_member(&alice, &NoGroups));
    }

    #[test]
    fn test_reserved_nickname_is_lowercased() {
        let mut lists = Affiliations::new();
        let alice = jid("alice@example.com");
        lists.apply(&alice, Affiliation::Member, Some("Wonderland"));
        assert_eq!(lists.reserved_nickname(&alice), Some("wonderland"));
        assert_eq!(lists.member_with_nickname("WONDERLAND"), Some(&alice));
    }

    #[test]
    fn test_empty_reserved_nickname_is_none() {
        let mut lists = Affiliations::new();
        let alice = jid("alice@example.com");
        lists.apply(&alice, Affiliation::Member, None);
        assert_eq!(lists.reserved_nickname(&alice), None);
    }

    #[test]
    fn test_group_entries_expand() {
        let mut groups = StaticGroups::new();
        groups.insert(jid("staff@example.com"), [jid("carol@example.com")]);

        let mut lists = Affiliations::new();
        lists.apply(&jid("staff@example.com"), Affiliation::Admin, None);

        assert!(lists.is_admin(&jid("carol@example.com"), &groups));
        assert!(!lists.is_admin(&jid("dave@example.com"), &groups));
        // Group membership never grants an explicit entry.
        assert_eq!(
            lists.direct_affiliation(&jid("carol@example.com")),
            Affiliation::None
        );
    }

    #[test]
    fn test_last_owner_detection() {
        let mut lists = Affiliations::new();
        let alice = jid("alice@example.com");
        lists.apply(&alice, Affiliation::Owner, None);
        assert!(lists.is_last_owner(&alice));

        lists.apply(&jid("bob@example.com"), Affiliation::Owner, None);
        assert!(!lists.is_last_owner(&alice));
    }
}
