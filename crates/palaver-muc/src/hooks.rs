//! Lifecycle and moderation callbacks into the surrounding service.
//!
//! The engine fires these only on the node that originated an operation;
//! follower nodes mirroring replicated state stay silent so a clustered
//! deployment notifies exactly once.

use async_trait::async_trait;
use jid::{BareJid, FullJid};

/// External observer and veto point for room lifecycle events.
///
/// Every method has a do-nothing (or allow-everything) default, so
/// implementations override only what they care about. The veto hooks run
/// before the room lock is taken and must not call back into the engine.
#[async_trait]
pub trait EngineHooks: Send + Sync {
    /// Whether the user may join at all. A `false` rejects the join with
    /// `Unauthorized` before any room-level validation runs.
    async fn joining_allowed(&self, _room: &BareJid, _user: &FullJid) -> bool {
        true
    }

    /// Whether the invitee may be invited. A `false` rejects the invitation
    /// with `CannotBeInvited`.
    async fn invitation_allowed(&self, _room: &BareJid, _invitee: &BareJid) -> bool {
        true
    }

    /// A session joined the room.
    async fn occupant_joined(&self, _room: &BareJid, _user: &FullJid, _nickname: &str) {}

    /// A session left the room (including kicks and bans).
    async fn occupant_left(&self, _room: &BareJid, _user: &FullJid, _nickname: &str) {}

    /// An occupant switched nicknames.
    async fn nickname_changed(
        &self,
        _room: &BareJid,
        _user: &FullJid,
        _old_nickname: &str,
        _new_nickname: &str,
    ) {
    }

    /// A groupchat message was accepted for broadcast.
    async fn message_received(&self, _room: &BareJid, _user: &FullJid, _nickname: &str) {}

    /// The room's subject changed.
    async fn subject_changed(&self, _room: &BareJid, _subject: &str) {}

    /// The last occupant left.
    async fn room_emptied(&self, _room: &BareJid) {}

    /// The room was destroyed.
    async fn room_destroyed(&self, _room: &BareJid) {}
}

/// Hooks that allow everything and observe nothing.
#[derive(Debug, Default)]
pub struct NoHooks;

#[async_trait]
impl EngineHooks for NoHooks {}
