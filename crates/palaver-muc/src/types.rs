//! Common types for the room engine.

use jid::Jid;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;
use xmpp_parsers::message::Message;
use xmpp_parsers::muc::user::{Affiliation as MucAffiliation, Role as MucRole};
use xmpp_parsers::presence::Presence;

/// Long-lived association between a bare JID and a room.
///
/// Ordered by privilege so that `max()` picks the strongest affiliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Affiliation {
    /// Banned from the room
    Outcast,
    /// No affiliation
    None,
    /// Room member
    Member,
    /// Room administrator
    Admin,
    /// Room owner
    Owner,
}

impl Affiliation {
    /// Convert to the wire-level MUC affiliation.
    pub fn to_muc(self) -> MucAffiliation {
        match self {
            Affiliation::Outcast => MucAffiliation::Outcast,
            Affiliation::None => MucAffiliation::None,
            Affiliation::Member => MucAffiliation::Member,
            Affiliation::Admin => MucAffiliation::Admin,
            Affiliation::Owner => MucAffiliation::Owner,
        }
    }
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Affiliation::Outcast => write!(f, "outcast"),
            Affiliation::None => write!(f, "none"),
            Affiliation::Member => write!(f, "member"),
            Affiliation::Admin => write!(f, "admin"),
            Affiliation::Owner => write!(f, "owner"),
        }
    }
}

/// Session-scoped permission level of a present occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// No role (not in room, or being removed)
    None,
    /// Visitor (can read, no voice in moderated rooms)
    Visitor,
    /// Participant (has voice)
    Participant,
    /// Moderator (can kick, grant/revoke voice)
    Moderator,
}

impl Role {
    /// Convert to the wire-level MUC role.
    pub fn to_muc(self) -> MucRole {
        match self {
            Role::None => MucRole::None,
            Role::Visitor => MucRole::Visitor,
            Role::Participant => MucRole::Participant,
            Role::Moderator => MucRole::Moderator,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::None => write!(f, "none"),
            Role::Visitor => write!(f, "visitor"),
            Role::Participant => write!(f, "participant"),
            Role::Moderator => write!(f, "moderator"),
        }
    }
}

/// Who may exchange private messages through the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivateMessagePolicy {
    /// Any occupant (the default)
    Anyone,
    /// Participants and moderators
    Participants,
    /// Moderators only
    Moderators,
    /// Nobody
    None,
}

impl PrivateMessagePolicy {
    /// Lowest role allowed to send a private message, if any.
    pub fn minimum_role(self) -> Option<Role> {
        match self {
            PrivateMessagePolicy::Anyone => Some(Role::Visitor),
            PrivateMessagePolicy::Participants => Some(Role::Participant),
            PrivateMessagePolicy::Moderators => Some(Role::Moderator),
            PrivateMessagePolicy::None => None,
        }
    }
}

impl Default for PrivateMessagePolicy {
    fn default() -> Self {
        PrivateMessagePolicy::Anyone
    }
}

/// Identity of a cluster node hosting room replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh node id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A routable packet delivered to occupants or relayed out of the room.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// A presence stanza
    Presence(Presence),
    /// A message stanza
    Message(Message),
}

impl Stanza {
    /// The stanza's destination address, if stamped.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Message(m) => m.to.as_ref(),
        }
    }

    /// Borrow the presence payload, if this is one.
    pub fn as_presence(&self) -> Option<&Presence> {
        match self {
            Stanza::Presence(p) => Some(p),
            Stanza::Message(_) => None,
        }
    }

    /// Borrow the message payload, if this is one.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Stanza::Presence(_) => None,
            Stanza::Message(m) => Some(m),
        }
    }
}

impl From<Presence> for Stanza {
    fn from(p: Presence) -> Self {
        Stanza::Presence(p)
    }
}

impl From<Message> for Stanza {
    fn from(m: Message) -> Self {
        Stanza::Message(m)
    }
}

/// Delivery channel of a locally-connected occupant session.
///
/// The connection layer hands one of these in at join time; the engine
/// pushes every stanza addressed to the session through it. A closed sink
/// (connection went away before the leave was processed) is not an error.
pub type StanzaSink = mpsc::UnboundedSender<Stanza>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affiliation_ordering() {
        assert!(Affiliation::Owner > Affiliation::Admin);
        assert!(Affiliation::Admin > Affiliation::Member);
        assert!(Affiliation::Member > Affiliation::None);
        assert!(Affiliation::None > Affiliation::Outcast);
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Moderator > Role::Participant);
        assert!(Role::Participant > Role::Visitor);
        assert!(Role::Visitor > Role::None);
    }

    #[test]
    fn test_private_message_policy_thresholds() {
        assert_eq!(
            PrivateMessagePolicy::Anyone.minimum_role(),
            Some(Role::Visitor)
        );
        assert_eq!(
            PrivateMessagePolicy::Moderators.minimum_role(),
            Some(Role::Moderator)
        );
        assert_eq!(PrivateMessagePolicy::None.minimum_role(), None);
    }
}
