//! Derivation of effective permissions and authority checks.
//!
//! Pure logic over the affiliation lists, the room mode flags, and group
//! membership. The precedence here is the single source of truth for both
//! the join path and the reconciliation pass after an affiliation change:
//! an outcast entry (explicit or group-derived) always trumps a member
//! entry.

use jid::BareJid;

use crate::affiliations::Affiliations;
use crate::config::RoomConfig;
use crate::error::MucError;
use crate::group::GroupResolver;
use crate::types::{Affiliation, Role};

/// Effective permission of a user who is (or wants to be) in the room.
///
/// Precedence, strongest first: owner, sysadmin (implicit owner), admin,
/// outcast (rejected), member, none. A user with no affiliation joins a
/// moderated room as visitor and any other room as participant; a
/// members-only room rejects them outright.
pub fn derive_membership(
    lists: &Affiliations,
    config: &RoomConfig,
    is_sysadmin: bool,
    groups: &dyn GroupResolver,
    jid: &BareJid,
) -> Result<(Affiliation, Role), MucError> {
    if lists.is_owner(jid, groups) {
        return Ok((Affiliation::Owner, Role::Moderator));
    }
    if is_sysadmin {
        // Service administrators act as owners without ever appearing in
        // the owner list.
        return Ok((Affiliation::Owner, Role::Moderator));
    }
    if lists.is_admin(jid, groups) {
        return Ok((Affiliation::Admin, Role::Moderator));
    }
    if lists.is_outcast(jid, groups) {
        return Err(MucError::Forbidden);
    }
    if lists.is_member(jid, groups) {
        return Ok((Affiliation::Member, Role::Participant));
    }
    if config.members_only {
        return Err(MucError::RegistrationRequired);
    }
    let role = if config.moderated {
        Role::Visitor
    } else {
        Role::Participant
    };
    Ok((Affiliation::None, role))
}

/// Outcome of re-deriving a present occupant after an affiliation change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The occupant stays, possibly with a new affiliation and role.
    Stay(Affiliation, Role),
    /// The occupant is removed with the given status code on the eviction
    /// presence: 301 for a ban, 321 for losing access to a members-only
    /// room.
    Kick(Affiliation, u16),
}

/// Re-derive a present occupant's affiliation and role.
///
/// Same precedence as [`derive_membership`], but rejections become kicks:
/// the occupant is already inside and has to be shown the door instead.
pub fn reconcile_membership(
    lists: &Affiliations,
    config: &RoomConfig,
    is_sysadmin: bool,
    groups: &dyn GroupResolver,
    jid: &BareJid,
) -> Reconciled {
    match derive_membership(lists, config, is_sysadmin, groups, jid) {
        Ok((affiliation, role)) => Reconciled::Stay(affiliation, role),
        Err(MucError::Forbidden) => Reconciled::Kick(Affiliation::Outcast, 301),
        Err(_) => Reconciled::Kick(Affiliation::None, 321),
    }
}

/// Authority check for granting `new` to a target currently holding `old`.
///
/// Touching the owner list in either direction takes an owner; everything
/// else takes admin or better, except that members-only rooms with open
/// invitations let any occupant add members.
pub fn authorize_affiliation_change(
    actor: Affiliation,
    old: Affiliation,
    new: Affiliation,
    config: &RoomConfig,
) -> Result<(), MucError> {
    if new == Affiliation::Owner || old == Affiliation::Owner {
        if actor != Affiliation::Owner {
            return Err(MucError::Forbidden);
        }
        return Ok(());
    }
    if new == Affiliation::Member && config.members_only && config.occupants_can_invite {
        return Ok(());
    }
    if actor < Affiliation::Admin {
        return Err(MucError::Forbidden);
    }
    Ok(())
}

/// Seniority check for a role change (voice grant/revoke, kick).
///
/// Only moderators act; admins cannot touch owners, and moderators without
/// an admin or owner affiliation cannot touch either.
pub fn may_change_role(
    actor_affiliation: Affiliation,
    actor_role: Role,
    target_affiliation: Affiliation,
) -> bool {
    if actor_role != Role::Moderator {
        return false;
    }
    match actor_affiliation {
        Affiliation::Owner => true,
        Affiliation::Admin => target_affiliation != Affiliation::Owner,
        _ => !matches!(
            target_affiliation,
            Affiliation::Owner | Affiliation::Admin
        ),
    }
}
