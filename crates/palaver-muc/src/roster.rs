//! The occupant registry: one owned store, three derived indices.
//!
//! The indices (lowercase nickname, bare JID, full JID) are only ever
//! touched through the insert/remove/rename API here, so they cannot drift
//! apart. The registry carries no locking of its own; it inherits the
//! owning room's write lock.

use std::collections::HashMap;

use jid::{BareJid, FullJid};

use crate::occupant::Occupant;

/// Opaque handle into the occupant store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OccupantId(u64);

/// In-memory indices over one room's live occupants.
#[derive(Debug, Default)]
pub struct OccupantRoster {
    next_id: u64,
    occupants: HashMap<OccupantId, Occupant>,
    by_nickname: HashMap<String, Vec<OccupantId>>,
    by_bare: HashMap<BareJid, Vec<OccupantId>>,
    by_full: HashMap<FullJid, OccupantId>,
}

impl OccupantRoster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an occupant under all three indices.
    ///
    /// The caller has already validated nickname ownership; a full-JID
    /// collision replaces the previous session entry (a session rejoining
    /// after a dropped connection).
    pub fn insert(&mut self, occupant: Occupant) -> OccupantId {
        if let Some(existing) = self.by_full.get(&occupant.user).copied() {
            self.remove(existing);
        }
        let id = OccupantId(self.next_id);
        self.next_id += 1;
        self.by_nickname
            .entry(occupant.nickname.to_lowercase())
            .or_default()
            .push(id);
        self.by_bare
            .entry(occupant.user.to_bare())
            .or_default()
            .push(id);
        self.by_full.insert(occupant.user.clone(), id);
        self.occupants.insert(id, occupant);
        id
    }

    /// Remove an occupant from all three indices.
    pub fn remove(&mut self, id: OccupantId) -> Option<Occupant> {
        let occupant = self.occupants.remove(&id)?;
        let nickname = occupant.nickname.to_lowercase();
        if let Some(ids) = self.by_nickname.get_mut(&nickname) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_nickname.remove(&nickname);
            }
        }
        let bare = occupant.user.to_bare();
        if let Some(ids) = self.by_bare.get_mut(&bare) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_bare.remove(&bare);
            }
        }
        self.by_full.remove(&occupant.user);
        Some(occupant)
    }

    /// Re-index an occupant under a new nickname, preserving identity.
    ///
    /// Old and new key move in the same critical section, so no lookup can
    /// observe the occupant under both (or neither) nickname.
    pub fn rename(&mut self, id: OccupantId, new_nickname: &str) {
        let Some(occupant) = self.occupants.get_mut(&id) else {
            return;
        };
        let old_key = occupant.nickname.to_lowercase();
        occupant.nickname = new_nickname.to_string();
        if let Some(ids) = self.by_nickname.get_mut(&old_key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_nickname.remove(&old_key);
            }
        }
        self.by_nickname
            .entry(new_nickname.to_lowercase())
            .or_default()
            .push(id);
    }

    /// All sessions joined under the given nickname (case-insensitive).
    pub fn by_nickname(&self, nickname: &str) -> Vec<OccupantId> {
        self.by_nickname
            .get(&nickname.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// All sessions of the given user.
    pub fn by_bare(&self, bare: &BareJid) -> Vec<OccupantId> {
        self.by_bare.get(bare).cloned().unwrap_or_default()
    }

    /// The single session connected from the given full JID.
    pub fn by_full(&self, full: &FullJid) -> Option<OccupantId> {
        self.by_full.get(full).copied()
    }

    /// Whether any session holds the given nickname.
    pub fn has_nickname(&self, nickname: &str) -> bool {
        self.by_nickname.contains_key(&nickname.to_lowercase())
    }

    /// Borrow an occupant.
    pub fn get(&self, id: OccupantId) -> Option<&Occupant> {
        self.occupants.get(&id)
    }

    /// Mutably borrow an occupant.
    pub fn get_mut(&mut self, id: OccupantId) -> Option<&mut Occupant> {
        self.occupants.get_mut(&id)
    }

    /// Iterate every live occupant.
    pub fn iter(&self) -> impl Iterator<Item = (OccupantId, &Occupant)> {
        self.occupants.iter().map(|(id, occ)| (*id, occ))
    }

    /// Ids of every live occupant.
    pub fn ids(&self) -> Vec<OccupantId> {
        self.occupants.keys().copied().collect()
    }

    /// Number of live occupants.
    pub fn len(&self) -> usize {
        self.occupants.len()
    }

    /// Whether the room is empty.
    pub fn is_empty(&self) -> bool {
        self.occupants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occupant::Location;
    use crate::types::{Affiliation, Role};
    use tokio::sync::mpsc;
    use xmpp_parsers::presence::{Presence, Type as PresenceType};

    fn occupant(nick: &str, jid: &str) -> Occupant {
        Occupant {
            nickname: nick.to_string(),
            user: jid.parse().unwrap(),
            role: Role::Participant,
            affiliation: Affiliation::None,
            presence: Presence::new(PresenceType::None),
            location: Location::Local {
                sink: mpsc::unbounded_channel().0,
            },
            deaf: false,
        }
    }

    fn indices_agree(roster: &OccupantRoster, id: OccupantId) -> bool {
        let occ = roster.get(id).unwrap();
        roster.by_nickname(&occ.nickname).contains(&id)
            && roster.by_bare(&occ.user.to_bare()).contains(&id)
            && roster.by_full(&occ.user) == Some(id)
    }

    #[test]
    fn test_insert_updates_all_indices() {
        let mut roster = OccupantRoster::new();
        let id = roster.insert(occupant("Alice", "alice@example.com/desktop"));
        assert!(indices_agree(&roster, id));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_nickname_lookup_is_case_insensitive() {
        let mut roster = OccupantRoster::new();
        let id = roster.insert(occupant("Alice", "alice@example.com/desktop"));
        assert_eq!(roster.by_nickname("ALICE"), vec![id]);
        assert!(roster.has_nickname("alice"));
    }

    #[test]
    fn test_multiple_sessions_share_nickname_and_bare_jid() {
        let mut roster = OccupantRoster::new();
        let a = roster.insert(occupant("alice", "alice@example.com/desktop"));
        let b = roster.insert(occupant("alice", "alice@example.com/mobile"));
        assert_eq!(roster.by_nickname("alice").len(), 2);
        let bare: BareJid = "alice@example.com".parse().unwrap();
        assert_eq!(roster.by_bare(&bare).len(), 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_remove_clears_all_indices() {
        let mut roster = OccupantRoster::new();
        let id = roster.insert(occupant("alice", "alice@example.com/desktop"));
        let removed = roster.remove(id).unwrap();
        assert_eq!(removed.nickname, "alice");
        assert!(roster.is_empty());
        assert!(!roster.has_nickname("alice"));
        let bare: BareJid = "alice@example.com".parse().unwrap();
        assert!(roster.by_bare(&bare).is_empty());
        assert_eq!(roster.by_full(&"alice@example.com/desktop".parse().unwrap()), None);
    }

    #[test]
    fn test_reinsert_same_full_jid_replaces_session() {
        let mut roster = OccupantRoster::new();
        roster.insert(occupant("alice", "alice@example.com/desktop"));
        let id = roster.insert(occupant("alice", "alice@example.com/desktop"));
        assert_eq!(roster.len(), 1);
        assert!(indices_agree(&roster, id));
    }

    #[test]
    fn test_rename_preserves_identity_and_full_jid_index() {
        let mut roster = OccupantRoster::new();
        let id = roster.insert(occupant("alice", "alice@example.com/desktop"));
        roster.rename(id, "wonderland");
        assert!(!roster.has_nickname("alice"));
        assert_eq!(roster.by_nickname("Wonderland"), vec![id]);
        assert_eq!(
            roster.by_full(&"alice@example.com/desktop".parse().unwrap()),
            Some(id)
        );
        assert_eq!(roster.get(id).unwrap().nickname, "wonderland");
    }
}
