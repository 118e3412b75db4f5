//! Replication events and synchronous cluster requests.
//!
//! Every state-changing room operation is described by a [`RoomEvent`]: a
//! serializable record carrying enough data to reapply the effect on another
//! node without re-validating permissions. The node that accepted the
//! triggering packet applies the event locally as the *originator* (which
//! authorizes persistence, history logging, and lifecycle side effects) and
//! publishes it to every other node hosting a replica of the room; receivers
//! mirror state only. The `origin` field is how a node recognizes, and
//! drops, its own events coming back around.

use jid::{BareJid, FullJid};
use serde::{Deserialize, Serialize};
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

use crate::config::RoomConfig;
use crate::types::{Affiliation, NodeId, Role, Stanza};

/// One replicated room mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    /// The room this event belongs to
    pub room: BareJid,
    /// The node that validated and first applied the mutation
    pub origin: NodeId,
    /// What changed
    pub payload: EventPayload,
}

/// The state change carried by a [`RoomEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A session joined the room on the originating node.
    OccupantJoined {
        /// Full replica of the new occupant
        occupant: OccupantData,
    },
    /// A session left (or was kicked/banned, per `statuses`).
    OccupantLeft {
        /// The user's real full JID
        user: FullJid,
        /// The nickname the session held
        nickname: String,
        /// Protocol status codes for the departure presence (307 kick,
        /// 301 ban, 321 affiliation removal; empty for a plain leave)
        statuses: Vec<u16>,
        /// Human-readable reason for kicks and bans
        reason: Option<String>,
    },
    /// An occupant's availability presence changed.
    PresenceUpdated {
        /// The user's real full JID
        user: FullJid,
        /// The new presence
        #[serde(with = "presence_xml")]
        presence: Presence,
    },
    /// An occupant's role or affiliation changed while present.
    OccupantUpdated {
        /// The user's real full JID
        user: FullJid,
        /// New role
        role: Role,
        /// New affiliation
        affiliation: Affiliation,
    },
    /// An occupant switched nicknames.
    NicknameChanged {
        /// The user's real full JID
        user: FullJid,
        /// Nickname before the change
        old_nickname: String,
        /// Nickname after the change
        new_nickname: String,
        /// The presence announcing the new nickname
        #[serde(with = "presence_xml")]
        presence: Presence,
    },
    /// An owner/admin/outcast entry changed (or was cleared with `None`).
    AffiliationAdded {
        /// The affected bare JID (an individual or a group)
        jid: BareJid,
        /// The granted affiliation
        affiliation: Affiliation,
    },
    /// A member entry changed, with its reserved nickname.
    MemberAdded {
        /// The affected bare JID (an individual or a group)
        jid: BareJid,
        /// Reserved nickname, empty when none was claimed
        reserved_nickname: String,
    },
    /// A groupchat message (possibly a subject change) was broadcast.
    MessageBroadcast {
        /// The message, already stamped with the sender's occupant address
        #[serde(with = "message_xml")]
        message: Message,
    },
    /// The room configuration changed (lock state included).
    ConfigChanged {
        /// The full new configuration
        config: RoomConfig,
        /// Whether the room is still locked pending configuration
        locked: bool,
    },
    /// The room was destroyed.
    RoomDestroyed {
        /// Address occupants are pointed at, if any
        alternate: Option<BareJid>,
        /// Human-readable reason
        reason: Option<String>,
    },
}

/// Replica of one occupant, shipped inside a join event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupantData {
    /// Nickname, as presented
    pub nickname: String,
    /// The user's real full JID
    pub user: FullJid,
    /// Derived role
    pub role: Role,
    /// Derived affiliation
    pub affiliation: Affiliation,
    /// The join presence
    #[serde(with = "presence_xml")]
    pub presence: Presence,
    /// The node the session is physically connected to
    pub node: NodeId,
}

/// A synchronous request to mutate (or deliver to) an occupant hosted on
/// another node.
///
/// The hosting node applies the change without re-validating permissions
/// (the requesting node already did) and answers with the occupant's updated
/// presence. An absent answer is a rejection, never a success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupantRequest {
    /// The room the occupant is in
    pub room: BareJid,
    /// The occupant's real full JID
    pub user: FullJid,
    /// What to do to them
    pub update: OccupantUpdate,
}

/// The mutation carried by an [`OccupantRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OccupantUpdate {
    /// Change the occupant's role; `Role::None` kicks them.
    SetRole {
        /// The new role
        role: Role,
        /// Reason shown on a kick
        reason: Option<String>,
    },
    /// Change the occupant's affiliation and recomputed role together.
    SetAffiliation {
        /// The new affiliation
        affiliation: Affiliation,
        /// The role derived from it
        role: Role,
    },
    /// Deliver a stanza to the occupant's session.
    Deliver {
        /// The stanza, stamped for the recipient
        #[serde(with = "stanza_xml")]
        stanza: Stanza,
    },
}

fn element_to_string(element: &minidom::Element) -> Result<String, String> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| format!("failed to serialize element: {e}"))?;
    String::from_utf8(output).map_err(|e| format!("invalid utf-8: {e}"))
}

fn element_from_str(raw: &str) -> Result<minidom::Element, String> {
    raw.parse::<minidom::Element>()
        .map_err(|e| format!("failed to parse element: {e}"))
}

/// Presence stanzas cross the cluster as their XML text.
mod presence_xml {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use xmpp_parsers::presence::Presence;

    pub fn serialize<S: Serializer>(presence: &Presence, serializer: S) -> Result<S::Ok, S::Error> {
        let element = minidom::Element::from(presence.clone());
        super::element_to_string(&element)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Presence, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let element = super::element_from_str(&raw).map_err(serde::de::Error::custom)?;
        Presence::try_from(element).map_err(serde::de::Error::custom)
    }
}

/// Message stanzas cross the cluster as their XML text.
mod message_xml {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use xmpp_parsers::message::Message;

    pub fn serialize<S: Serializer>(message: &Message, serializer: S) -> Result<S::Ok, S::Error> {
        let element = minidom::Element::from(message.clone());
        super::element_to_string(&element)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Message, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let element = super::element_from_str(&raw).map_err(serde::de::Error::custom)?;
        Message::try_from(element).map_err(serde::de::Error::custom)
    }
}

/// Either stanza kind, distinguished by its element name on the way back in.
mod stanza_xml {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use xmpp_parsers::message::Message;
    use xmpp_parsers::presence::Presence;

    use crate::types::Stanza;

    pub fn serialize<S: Serializer>(stanza: &Stanza, serializer: S) -> Result<S::Ok, S::Error> {
        let element = match stanza {
            Stanza::Presence(p) => minidom::Element::from(p.clone()),
            Stanza::Message(m) => minidom::Element::from(m.clone()),
        };
        super::element_to_string(&element)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Stanza, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let element = super::element_from_str(&raw).map_err(serde::de::Error::custom)?;
        match element.name() {
            "presence" => Presence::try_from(element)
                .map(Stanza::Presence)
                .map_err(serde::de::Error::custom),
            "message" => Message::try_from(element)
                .map(Stanza::Message)
                .map_err(serde::de::Error::custom),
            other => Err(serde::de::Error::custom(format!(
                "unexpected stanza element <{other}>"
            ))),
        }
    }
}
