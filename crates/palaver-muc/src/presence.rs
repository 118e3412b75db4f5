//! Building the MUC presence and invitation stanzas the room emits.
//!
//! Every presence leaving the room carries a `muc#user` extension with the
//! subject's affiliation, role, and (where the recipient may see it) real
//! JID, plus the protocol status codes: 100 non-anonymous, 110 self, 201
//! room created, 301 banned, 303 nickname change, 307 kicked, 321 removed
//! by affiliation change.

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use xmpp_parsers::message::Message;
use xmpp_parsers::muc::user::{Item, MucUser, Reason, Status};
use xmpp_parsers::presence::Presence;

use crate::types::{Affiliation, Role};

/// Namespace for MUC join requests.
pub const NS_MUC: &str = "http://jabber.org/protocol/muc";

/// Namespace for the MUC user protocol.
pub const NS_MUC_USER: &str = "http://jabber.org/protocol/muc#user";

/// Legacy conference announcement namespace.
pub const NS_X_CONFERENCE: &str = "jabber:x:conference";

/// The typed status for a protocol status code emitted by this engine.
pub fn status_for(code: u16) -> Option<Status> {
    match code {
        100 => Some(Status::NonAnonymousRoom),
        110 => Some(Status::SelfPresence),
        201 => Some(Status::RoomHasBeenCreated),
        301 => Some(Status::Banned),
        303 => Some(Status::NewNick),
        307 => Some(Status::Kicked),
        321 => Some(Status::RemovalFromRoom),
        _ => None,
    }
}

/// The status codes carried by a presence's `muc#user` extension.
pub fn status_codes(presence: &Presence) -> Vec<u16> {
    presence
        .payloads
        .iter()
        .filter(|payload| payload.is("x", NS_MUC_USER))
        .flat_map(|x| x.children())
        .filter(|child| child.name() == "status")
        .filter_map(|status| status.attr("code"))
        .filter_map(|code| code.parse().ok())
        .collect()
}

/// What a room presence says about its subject.
#[derive(Debug, Clone)]
pub struct PresenceSpec<'a> {
    /// The subject's availability presence (its type, show, and status
    /// strings are preserved; any muc payloads it carried are dropped)
    pub base: &'a Presence,
    /// The subject's occupant address (`room@service/nickname`)
    pub from: FullJid,
    /// The subject's affiliation
    pub affiliation: Affiliation,
    /// The subject's role
    pub role: Role,
    /// The subject's real JID, when the recipient may discover it
    pub real_jid: Option<&'a FullJid>,
    /// New nickname, for nickname-change (303) announcements
    pub new_nick: Option<&'a str>,
    /// Human-readable reason, for kicks and bans
    pub reason: Option<&'a str>,
    /// Protocol status codes to attach
    pub statuses: &'a [u16],
}

/// Build a room presence from a spec. The caller stamps `to` per recipient.
pub fn build_presence(spec: PresenceSpec<'_>) -> Presence {
    let mut presence = spec.base.clone();
    presence
        .payloads
        .retain(|payload| !payload.is("x", NS_MUC) && !payload.is("x", NS_MUC_USER));
    presence.from = Some(Jid::from(spec.from));
    presence.to = None;

    let item = Item {
        affiliation: spec.affiliation.to_muc(),
        role: spec.role.to_muc(),
        jid: spec.real_jid.cloned(),
        nick: spec.new_nick.map(|nick| nick.to_string()),
        actor: None,
        continue_: None,
        reason: spec.reason.map(|reason| Reason(reason.to_string())),
    };
    let muc_user = MucUser {
        status: spec.statuses.iter().filter_map(|code| status_for(*code)).collect(),
        items: vec![item],
    };
    presence.payloads.push(muc_user.into());
    presence
}

/// Build the eviction presence sent to each occupant of a destroyed room.
pub fn destroy_presence(
    from: FullJid,
    alternate: Option<&BareJid>,
    reason: Option<&str>,
) -> Presence {
    let mut presence = Presence::new(xmpp_parsers::presence::Type::Unavailable);
    presence.from = Some(Jid::from(from));

    let item = Element::builder("item", NS_MUC_USER)
        .attr("affiliation", "none")
        .attr("role", "none")
        .build();
    let mut destroy = Element::builder("destroy", NS_MUC_USER);
    if let Some(alternate) = alternate {
        destroy = destroy.attr("jid", alternate.to_string());
    }
    if let Some(reason) = reason {
        destroy = destroy.append(Element::builder("reason", NS_MUC_USER).append(reason).build());
    }
    let x = Element::builder("x", NS_MUC_USER)
        .append(item)
        .append(destroy.build())
        .build();
    presence.payloads.push(x);
    presence
}

/// Build a mediated invitation (XEP-0045 §7.8.2).
pub fn invite_message(
    room: &BareJid,
    to: &BareJid,
    inviter: Option<&BareJid>,
    reason: Option<&str>,
    password: Option<&str>,
) -> Message {
    let mut message = Message::new(Some(Jid::from(to.clone())));
    message.from = Some(Jid::from(room.clone()));

    let mut invite = Element::builder("invite", NS_MUC_USER);
    if let Some(inviter) = inviter {
        invite = invite.attr("from", inviter.to_string());
    }
    if let Some(reason) = reason {
        invite = invite.append(Element::builder("reason", NS_MUC_USER).append(reason).build());
    }
    let mut x = Element::builder("x", NS_MUC_USER).append(invite.build());
    if let Some(password) = password {
        x = x.append(
            Element::builder("password", NS_MUC_USER)
                .append(password)
                .build(),
        );
    }
    message.payloads.push(x.build());

    // jabber:x:conference copy for older clients.
    message.payloads.push(
        Element::builder("x", NS_X_CONFERENCE)
            .attr("jid", room.to_string())
            .build(),
    );
    message
}

/// Build a mediated invitation rejection (XEP-0045 §7.8.2).
pub fn decline_message(
    room: &BareJid,
    to: &BareJid,
    decliner: &BareJid,
    reason: Option<&str>,
) -> Message {
    let mut message = Message::new(Some(Jid::from(to.clone())));
    message.from = Some(Jid::from(room.clone()));

    let mut decline = Element::builder("decline", NS_MUC_USER).attr("from", decliner.to_string());
    if let Some(reason) = reason {
        decline = decline.append(Element::builder("reason", NS_MUC_USER).append(reason).build());
    }
    message
        .payloads
        .push(Element::builder("x", NS_MUC_USER).append(decline.build()).build());
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::presence::Type as PresenceType;

    fn occupant_jid(s: &str) -> FullJid {
        s.parse().unwrap()
    }

    #[test]
    fn test_build_presence_carries_item_and_statuses() {
        let base = Presence::new(PresenceType::None);
        let real = occupant_jid("alice@example.com/desktop");
        let presence = build_presence(PresenceSpec {
            base: &base,
            from: occupant_jid("lobby@conference.example.com/alice"),
            affiliation: Affiliation::Owner,
            role: Role::Moderator,
            real_jid: Some(&real),
            new_nick: None,
            reason: None,
            statuses: &[110, 201],
        });

        assert_eq!(status_codes(&presence), vec![110, 201]);
        let muc_user = presence
            .payloads
            .iter()
            .find(|p| p.is("x", NS_MUC_USER))
            .cloned()
            .map(MucUser::try_from)
            .unwrap()
            .unwrap();
        assert_eq!(muc_user.items.len(), 1);
        assert_eq!(muc_user.items[0].jid, Some(real));
    }

    #[test]
    fn test_build_presence_strips_client_muc_payloads() {
        let mut base = Presence::new(PresenceType::None);
        base.payloads.push(Element::builder("x", NS_MUC).build());
        let presence = build_presence(PresenceSpec {
            base: &base,
            from: occupant_jid("lobby@conference.example.com/alice"),
            affiliation: Affiliation::None,
            role: Role::Participant,
            real_jid: None,
            new_nick: None,
            reason: None,
            statuses: &[],
        });
        assert!(!presence.payloads.iter().any(|p| p.is("x", NS_MUC)));
        assert!(presence.payloads.iter().any(|p| p.is("x", NS_MUC_USER)));
    }

    #[test]
    fn test_kick_presence_carries_reason() {
        let base = Presence::new(PresenceType::Unavailable);
        let presence = build_presence(PresenceSpec {
            base: &base,
            from: occupant_jid("lobby@conference.example.com/troll"),
            affiliation: Affiliation::None,
            role: Role::None,
            real_jid: None,
            new_nick: None,
            reason: Some("spamming"),
            statuses: &[307],
        });
        assert_eq!(status_codes(&presence), vec![307]);
        let muc_user = presence
            .payloads
            .iter()
            .find(|p| p.is("x", NS_MUC_USER))
            .cloned()
            .map(MucUser::try_from)
            .unwrap()
            .unwrap();
        assert_eq!(muc_user.items[0].reason, Some(Reason("spamming".to_string())));
    }

    #[test]
    fn test_destroy_presence_shape() {
        let alternate: BareJid = "annex@conference.example.com".parse().unwrap();
        let presence = destroy_presence(
            occupant_jid("lobby@conference.example.com/alice"),
            Some(&alternate),
            Some("closing"),
        );
        let x = presence
            .payloads
            .iter()
            .find(|p| p.is("x", NS_MUC_USER))
            .unwrap();
        let destroy = x
            .children()
            .find(|child| child.name() == "destroy")
            .unwrap();
        assert_eq!(destroy.attr("jid"), Some("annex@conference.example.com"));
    }

    #[test]
    fn test_invite_message_shape() {
        let room: BareJid = "lobby@conference.example.com".parse().unwrap();
        let to: BareJid = "carol@example.com".parse().unwrap();
        let inviter: BareJid = "alice@example.com".parse().unwrap();
        let message = invite_message(&room, &to, Some(&inviter), Some("join us"), Some("sekrit"));

        let x = message
            .payloads
            .iter()
            .find(|p| p.is("x", NS_MUC_USER))
            .unwrap();
        let invite = x.children().find(|child| child.name() == "invite").unwrap();
        assert_eq!(invite.attr("from"), Some("alice@example.com"));
        assert!(x.children().any(|child| child.name() == "password"));
        assert!(message
            .payloads
            .iter()
            .any(|p| p.is("x", NS_X_CONFERENCE)));
    }

    #[test]
    fn test_decline_message_shape() {
        let room: BareJid = "lobby@conference.example.com".parse().unwrap();
        let to: BareJid = "alice@example.com".parse().unwrap();
        let decliner: BareJid = "carol@example.com".parse().unwrap();
        let message = decline_message(&room, &to, &decliner, None);
        let x = message
            .payloads
            .iter()
            .find(|p| p.is("x", NS_MUC_USER))
            .unwrap();
        assert!(x.children().any(|child| child.name() == "decline"));
    }
}
