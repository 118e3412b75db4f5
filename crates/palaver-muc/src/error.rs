//! Error types for the room engine.

use thiserror::Error;

/// Recoverable room-engine errors.
///
/// Every variant maps 1:1 to an XMPP stanza error condition; the stanza
/// router owns that translation. None of these leave a room in a
/// partially-mutated state: an operation either applies fully under the
/// room's write lock or rejects before mutating anything.
#[derive(Debug, Error)]
pub enum MucError {
    /// The actor lacks the privilege for the attempted operation, or the
    /// target is banned from the room.
    #[error("insufficient privileges")]
    Forbidden,

    /// Nickname already claimed by another user, or the change would leave
    /// the room without an owner.
    #[error("conflict with existing room state")]
    Conflict,

    /// A role/affiliation change violates seniority rules, or a remote-node
    /// call failed, timed out, or returned a rejection.
    #[error("operation not allowed")]
    NotAllowed,

    /// Nickname policy violation (reserved-nickname login restriction, or a
    /// nickname that is not a valid resource).
    #[error("not acceptable")]
    NotAcceptable,

    /// Members-only room joined by a non-member.
    #[error("registration required")]
    RegistrationRequired,

    /// The room is locked pending initial configuration.
    #[error("room is locked")]
    RoomLocked,

    /// Missing or incorrect room password.
    #[error("not authorized")]
    Unauthorized,

    /// The room occupancy limit has been reached.
    #[error("service unavailable")]
    ServiceUnavailable,

    /// The service delegate vetoed the invitation.
    #[error("user cannot be invited")]
    CannotBeInvited,

    /// No occupant with the given nickname.
    #[error("no such occupant: {0}")]
    ItemNotFound(String),

    /// Persistence gateway failure. In-memory state stays authoritative;
    /// callers log and continue.
    #[error("storage error: {0}")]
    Storage(String),
}

impl MucError {
    /// Stanza error condition name for this rejection (RFC 6120 §8.3.3).
    pub fn condition(&self) -> &'static str {
        match self {
            Self::Forbidden => "forbidden",
            Self::Conflict => "conflict",
            Self::NotAllowed => "not-allowed",
            Self::NotAcceptable => "not-acceptable",
            Self::RegistrationRequired => "registration-required",
            Self::RoomLocked => "item-not-found",
            Self::Unauthorized => "not-authorized",
            Self::ServiceUnavailable => "service-unavailable",
            Self::CannotBeInvited => "not-allowed",
            Self::ItemNotFound(_) => "item-not-found",
            Self::Storage(_) => "internal-server-error",
        }
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
