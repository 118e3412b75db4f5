//! Occupants: one connected session inside one room.

use jid::{BareJid, FullJid};
use tracing::debug;
use xmpp_parsers::presence::Presence;

use crate::types::{Affiliation, NodeId, Role, Stanza, StanzaSink};

/// Where an occupant's session is physically connected.
#[derive(Debug, Clone)]
pub enum Location {
    /// Connected to this node; stanzas go straight into the session sink.
    Local {
        /// Delivery channel of the session
        sink: StanzaSink,
    },
    /// Connected to another cluster node. The local entry is a replica kept
    /// current by replication events; mutations are forwarded to the
    /// hosting node as synchronous cluster requests.
    Remote {
        /// The hosting node
        node: NodeId,
    },
}

/// A user's live session inside a room.
///
/// Owned exclusively by the room engine and mutated only under the room's
/// write lock; everything handed to callers is an [`OccupantSnapshot`].
#[derive(Debug)]
pub struct Occupant {
    /// Nickname, as presented (lookups are case-insensitive)
    pub nickname: String,
    /// The user's real full JID
    pub user: FullJid,
    /// Derived session role
    pub role: Role,
    /// Derived affiliation
    pub affiliation: Affiliation,
    /// Last availability presence received from (or replicated for) the user
    pub presence: Presence,
    /// Local session or remote replica
    pub location: Location,
    /// Deaf occupants receive no broadcast messages
    pub deaf: bool,
}

impl Occupant {
    /// Whether this session is connected to this node.
    pub fn is_local(&self) -> bool {
        matches!(self.location, Location::Local { .. })
    }

    /// The hosting node for a remote replica.
    pub fn node(&self) -> Option<NodeId> {
        match self.location {
            Location::Local { .. } => None,
            Location::Remote { node } => Some(node),
        }
    }

    /// The user's bare JID.
    pub fn bare(&self) -> BareJid {
        self.user.to_bare()
    }

    /// Deliver a stanza to this session.
    ///
    /// Remote replicas drop the stanza; the hosting node delivers from its
    /// own copy. A closed local sink means the connection already went away
    /// and the leave is still in flight.
    pub fn send(&self, stanza: Stanza) {
        match &self.location {
            Location::Local { sink } => {
                if sink.send(stanza).is_err() {
                    debug!(user = %self.user, nickname = %self.nickname, "occupant sink closed");
                }
            }
            Location::Remote { .. } => {}
        }
    }

    /// Read-only view handed to callers.
    pub fn snapshot(&self) -> OccupantSnapshot {
        OccupantSnapshot {
            nickname: self.nickname.clone(),
            user: self.user.clone(),
            role: self.role,
            affiliation: self.affiliation,
            node: self.node(),
        }
    }
}

/// Read-only view of an occupant at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupantSnapshot {
    /// Nickname, as presented
    pub nickname: String,
    /// The user's real full JID
    pub user: FullJid,
    /// Session role
    pub role: Role,
    /// Affiliation
    pub affiliation: Affiliation,
    /// Hosting node, `None` for local sessions
    pub node: Option<NodeId>,
}

impl OccupantSnapshot {
    /// The user's bare JID.
    pub fn bare(&self) -> BareJid {
        self.user.to_bare()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use xmpp_parsers::presence::{Presence, Type as PresenceType};

    fn occupant(nick: &str, jid: &str, sink: StanzaSink) -> Occupant {
        Occupant {
            nickname: nick.to_string(),
            user: jid.parse().unwrap(),
            role: Role::Participant,
            affiliation: Affiliation::Member,
            presence: Presence::new(PresenceType::None),
            location: Location::Local { sink },
            deaf: false,
        }
    }

    #[test]
    fn test_local_send_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let occ = occupant("nick", "user@example.com/res", tx);
        occ.send(Stanza::Presence(Presence::new(PresenceType::None)));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_send_on_closed_sink_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let occ = occupant("nick", "user@example.com/res", tx);
        // Must not panic.
        occ.send(Stanza::Presence(Presence::new(PresenceType::None)));
    }

    #[test]
    fn test_remote_snapshot_carries_node() {
        let node = NodeId::new();
        let occ = Occupant {
            location: Location::Remote { node },
            ..occupant("nick", "user@example.com/res", mpsc::unbounded_channel().0)
        };
        assert!(!occ.is_local());
        assert_eq!(occ.snapshot().node, Some(node));
    }
}
