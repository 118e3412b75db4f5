//! Room and service configuration.

use std::collections::HashSet;
use std::time::Duration;

use jid::BareJid;
use serde::{Deserialize, Serialize};

use crate::history::HistoryStrategy;
use crate::types::{PrivateMessagePolicy, Role};

/// Per-room configuration, as submitted through the owner's configuration
/// form and persisted alongside the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Natural-language room name
    pub name: String,
    /// Room description
    pub description: Option<String>,
    /// Room password; `Some` makes the room password-protected
    pub password: Option<String>,
    /// Maximum number of occupants (0 = unlimited)
    pub max_occupants: u32,
    /// Whether the room is listed in service discovery
    pub public_room: bool,
    /// Whether the room survives its last occupant leaving
    pub persistent: bool,
    /// Whether visitors lack voice
    pub moderated: bool,
    /// Whether joining requires affiliation of member or better
    pub members_only: bool,
    /// Whether plain occupants may invite others to a members-only room
    pub occupants_can_invite: bool,
    /// Whether occupants with voice may change the subject
    pub occupants_can_change_subject: bool,
    /// Whether every occupant (not just moderators) sees real JIDs
    pub anyone_can_discover_jid: bool,
    /// Whether broadcast messages are queued for conversation logging
    pub logging_enabled: bool,
    /// Whether members must join under their reserved nickname
    pub nickname_login_restricted: bool,
    /// Whether occupants may change nickname while in the room
    pub change_nickname_allowed: bool,
    /// Whether users may register a reserved nickname with the room
    pub registration_enabled: bool,
    /// Roles whose availability changes are broadcast to the room
    pub roles_to_broadcast_presence: Vec<Role>,
    /// Who may exchange private messages through the room
    pub private_message_policy: PrivateMessagePolicy,
}

impl RoomConfig {
    /// Whether a presence for the given role is broadcast room-wide.
    pub fn broadcasts_role(&self, role: Role) -> bool {
        // Role::None (leave/kick) is always broadcast.
        role == Role::None || self.roles_to_broadcast_presence.contains(&role)
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            password: None,
            max_occupants: 30,
            public_room: true,
            persistent: false,
            moderated: false,
            members_only: false,
            occupants_can_invite: false,
            occupants_can_change_subject: false,
            anyone_can_discover_jid: false,
            logging_enabled: false,
            nickname_login_restricted: false,
            change_nickname_allowed: true,
            registration_enabled: true,
            roles_to_broadcast_presence: vec![Role::Moderator, Role::Participant, Role::Visitor],
            private_message_policy: PrivateMessagePolicy::Anyone,
        }
    }
}

/// Service-level knobs shared by every room hosted by a node.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Domain of the groupchat service (e.g. `conference.example.org`)
    pub domain: String,
    /// Bare JIDs treated as implicit owners of every room
    pub sysadmins: HashSet<BareJid>,
    /// Deadline for the synchronous cluster round-trip to a remote
    /// occupant's hosting node; expiry fails the operation closed
    pub remote_call_timeout: Duration,
    /// History retention applied to newly created rooms
    pub history: HistoryStrategy,
    /// Flush interval of the conversation-log batch writer
    pub log_flush_interval: Duration,
}

impl ServiceConfig {
    /// Create a config for the given service domain with defaults.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            sysadmins: HashSet::new(),
            remote_call_timeout: Duration::from_secs(2),
            history: HistoryStrategy::default(),
            log_flush_interval: Duration::from_secs(5),
        }
    }

    /// Whether the given bare JID is a service administrator.
    pub fn is_sysadmin(&self, jid: &BareJid) -> bool {
        self.sysadmins.contains(jid)
    }
}
