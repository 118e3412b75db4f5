//! The room engine: membership, permissions, and fan-out for one room.
//!
//! A [`Room`] owns its occupant registry, affiliation lists, configuration,
//! and history behind a single `RwLock`. Mutating operations validate under
//! the write lock, apply fully or not at all, deliver stanzas to local
//! sessions, and describe the change as a [`RoomEvent`] which is published
//! to the other nodes hosting a replica once the lock is released. The
//! synchronous round-trip to a remote occupant's hosting node likewise runs
//! strictly outside the lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jid::{BareJid, FullJid, Jid};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use xmpp_parsers::message::{Body, Message, MessageType, Subject};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::affiliations::Affiliations;
use crate::cluster::{update_remote_occupant, ClusterBus, NullClusterBus};
use crate::config::{RoomConfig, ServiceConfig};
use crate::error::MucError;
use crate::event::{EventPayload, OccupantData, OccupantRequest, OccupantUpdate, RoomEvent};
use crate::group::{GroupResolver, NoGroups};
use crate::history::{HistoryRequest, RoomHistory};
use crate::hooks::{EngineHooks, NoHooks};
use crate::occupant::{Location, Occupant, OccupantSnapshot};
use crate::presence::{
    build_presence, decline_message, destroy_presence, invite_message, PresenceSpec, NS_MUC,
    NS_MUC_USER,
};
use crate::privileges::{
    authorize_affiliation_change, derive_membership, may_change_role, reconcile_membership,
    Reconciled,
};
use crate::roster::{OccupantId, OccupantRoster};
use crate::storage::{HistoryLogger, HistoryRow, PersistenceGateway, RoomSnapshot};
use crate::types::{Affiliation, NodeId, Role, Stanza, StanzaSink};

/// Legacy extension a client attaches to its join presence to opt out of
/// broadcast messages. Kept wire-compatible with the extension older
/// deployments already use.
const NS_DEAF_OCCUPANT: &str = "http://jivesoftware.org/protocol/muc";

/// Everything a room needs from the node it runs on.
///
/// One context is shared by every room a service hosts on this node; rooms
/// clone it at construction.
#[derive(Clone)]
pub struct ServiceContext {
    /// This node's cluster identity
    pub node: NodeId,
    /// Service-level configuration
    pub config: ServiceConfig,
    /// Transport to the other nodes hosting replicas
    pub bus: Arc<dyn ClusterBus>,
    /// Load/save contract with the database layer
    pub gateway: Arc<dyn PersistenceGateway>,
    /// Expansion of group-addressed affiliation entries
    pub groups: Arc<dyn GroupResolver>,
    /// Lifecycle observers and veto points
    pub hooks: Arc<dyn EngineHooks>,
    /// Queue feeding the conversation log
    pub log: HistoryLogger,
}

impl ServiceContext {
    /// Context for a single-node deployment: no clustering, no shared
    /// groups, no hooks. Must be called from within a tokio runtime (the
    /// conversation-log flush task is spawned here).
    pub fn standalone(config: ServiceConfig, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let log = HistoryLogger::spawn(gateway.clone(), config.log_flush_interval);
        Self {
            node: NodeId::new(),
            config,
            bus: Arc::new(NullClusterBus),
            gateway,
            groups: Arc::new(NoGroups),
            hooks: Arc::new(NoHooks),
            log,
        }
    }
}

/// Everything behind the room's lock.
struct RoomState {
    config: RoomConfig,
    room_id: Option<i64>,
    subject: String,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    empty_since: Option<DateTime<Utc>>,
    locked_since: Option<DateTime<Utc>>,
    just_created: bool,
    destroyed: bool,
    affiliations: Affiliations,
    roster: OccupantRoster,
    history: RoomHistory,
}

/// One presence announcement fanned out to the room.
///
/// The fan-out builds a per-recipient copy: the subject's real JID is shown
/// only to moderators (or to everyone in a non-anonymous room), and the
/// copies delivered to the subject's own sessions additionally carry
/// `self_statuses` (110 and friends).
struct Announcement<'a> {
    occupant_jid: FullJid,
    real: &'a FullJid,
    affiliation: Affiliation,
    role: Role,
    base: &'a Presence,
    statuses: &'a [u16],
    self_statuses: &'a [u16],
    new_nick: Option<&'a str>,
    reason: Option<&'a str>,
    room_wide: bool,
}

/// One multi-user chat room, replicated across the cluster.
pub struct Room {
    address: BareJid,
    ctx: ServiceContext,
    state: RwLock<RoomState>,
}

impl Room {
    /// Create a brand-new room owned by `creator`.
    ///
    /// The room starts locked and stays locked until the creator submits
    /// its first configuration; the creator's first join is answered with
    /// status 201.
    pub fn create(
        ctx: ServiceContext,
        name: &str,
        creator: &BareJid,
    ) -> Result<Arc<Self>, MucError> {
        let address: BareJid = format!("{name}@{}", ctx.config.domain)
            .parse()
            .map_err(|_| MucError::NotAcceptable)?;
        let now = Utc::now();
        let mut affiliations = Affiliations::new();
        affiliations.apply(creator, Affiliation::Owner, None);
        let history = RoomHistory::new(ctx.config.history.clone());
        let config = RoomConfig {
            name: name.to_string(),
            ..Default::default()
        };
        info!(room = %address, creator = %creator, "created room");
        Ok(Arc::new(Self {
            address,
            ctx,
            state: RwLock::new(RoomState {
                config,
                room_id: None,
                subject: String::new(),
                created_at: now,
                modified_at: now,
                empty_since: None,
                locked_since: Some(now),
                just_created: true,
                destroyed: false,
                affiliations,
                roster: OccupantRoster::new(),
                history,
            }),
        }))
    }

    /// Rebuild a persisted room from its snapshot and (when conversation
    /// logging was enabled) its logged history rows, oldest first.
    pub fn load(
        ctx: ServiceContext,
        snapshot: RoomSnapshot,
        history_rows: Vec<HistoryRow>,
    ) -> Result<Arc<Self>, MucError> {
        let address: BareJid = format!("{}@{}", snapshot.name, ctx.config.domain)
            .parse()
            .map_err(|_| MucError::NotAcceptable)?;
        let mut affiliations = Affiliations::new();
        for jid in &snapshot.owners {
            affiliations.apply(jid, Affiliation::Owner, None);
        }
        for jid in &snapshot.admins {
            affiliations.apply(jid, Affiliation::Admin, None);
        }
        for (jid, nickname) in &snapshot.members {
            affiliations.apply(jid, Affiliation::Member, Some(nickname));
        }
        for jid in &snapshot.outcasts {
            affiliations.apply(jid, Affiliation::Outcast, None);
        }
        let mut history = RoomHistory::new(ctx.config.history.clone());
        for row in history_rows {
            let Ok(from) = address.with_resource_str(&row.nickname) else {
                continue;
            };
            let mut message = Message::new(None::<Jid>);
            message.type_ = MessageType::Groupchat;
            message.from = Some(Jid::from(from));
            if let Some(subject) = row.subject {
                message.subjects.insert(String::new(), Subject(subject));
            }
            if let Some(body) = row.body {
                message.bodies.insert(String::new(), Body(body));
            }
            history.add_message(message, row.stamp);
        }
        debug!(room = %address, "loaded room from storage");
        Ok(Arc::new(Self {
            address,
            ctx,
            state: RwLock::new(RoomState {
                config: snapshot.config,
                room_id: snapshot.room_id,
                subject: snapshot.subject,
                created_at: snapshot.created_at,
                modified_at: snapshot.modified_at,
                empty_since: snapshot.empty_since,
                locked_since: None,
                just_created: false,
                destroyed: false,
                affiliations,
                roster: OccupantRoster::new(),
                history,
            }),
        }))
    }

    /// The room's bare address (`name@service-domain`).
    pub fn address(&self) -> &BareJid {
        &self.address
    }

    /// The node this replica runs on.
    pub fn node(&self) -> NodeId {
        self.ctx.node
    }

    /// Snapshots of every live occupant.
    pub async fn occupants(&self) -> Vec<OccupantSnapshot> {
        let state = self.state.read().await;
        state.roster.iter().map(|(_, occ)| occ.snapshot()).collect()
    }

    /// Number of live occupants (local sessions and remote replicas).
    pub async fn occupant_count(&self) -> usize {
        self.state.read().await.roster.len()
    }

    /// Snapshots of the sessions joined under a nickname.
    pub async fn occupants_by_nickname(&self, nickname: &str) -> Vec<OccupantSnapshot> {
        let state = self.state.read().await;
        state
            .roster
            .by_nickname(nickname)
            .into_iter()
            .filter_map(|id| state.roster.get(id))
            .map(Occupant::snapshot)
            .collect()
    }

    /// The current subject.
    pub async fn subject(&self) -> String {
        self.state.read().await.subject.clone()
    }

    /// Whether the room is still locked pending initial configuration.
    pub async fn is_locked(&self) -> bool {
        self.state.read().await.locked_since.is_some()
    }

    /// Whether the room has been destroyed.
    pub async fn is_destroyed(&self) -> bool {
        self.state.read().await.destroyed
    }

    /// A copy of the current configuration.
    pub async fn config(&self) -> RoomConfig {
        self.state.read().await.config.clone()
    }

    /// The explicit affiliation recorded for a bare JID.
    pub async fn affiliation_of(&self, jid: &BareJid) -> Affiliation {
        self.state.read().await.affiliations.direct_affiliation(jid)
    }

    /// The nickname a member has reserved, if any.
    pub async fn reserved_nickname(&self, jid: &BareJid) -> Option<String> {
        self.state
            .read()
            .await
            .affiliations
            .reserved_nickname(jid)
            .map(String::from)
    }

    /// A persistable snapshot of the room.
    pub async fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.read().await;
        self.snapshot_locked(&state)
    }

    fn snapshot_locked(&self, state: &RoomState) -> RoomSnapshot {
        RoomSnapshot {
            name: self
                .address
                .node()
                .map(|node| node.as_str().to_string())
                .unwrap_or_default(),
            room_id: state.room_id,
            config: state.config.clone(),
            subject: state.subject.clone(),
            created_at: state.created_at,
            modified_at: state.modified_at,
            empty_since: state.empty_since,
            owners: state.affiliations.owners().cloned().collect(),
            admins: state.affiliations.admins().cloned().collect(),
            members: state
                .affiliations
                .members()
                .map(|(jid, nick)| (jid.clone(), nick.to_string()))
                .collect(),
            outcasts: state.affiliations.outcasts().cloned().collect(),
        }
    }

    /// The occupant address for a nickname (`room@service/nickname`).
    ///
    /// Doubles as nickname validation: a string that is not a legal
    /// resource is not a legal nickname.
    fn occupant_jid(&self, nickname: &str) -> Result<FullJid, MucError> {
        self.address
            .with_resource_str(nickname)
            .map_err(|_| MucError::NotAcceptable)
    }

    /// Publish replication events to the other nodes. Never called while
    /// holding the room lock.
    async fn publish(&self, payloads: Vec<EventPayload>) {
        for payload in payloads {
            self.ctx
                .bus
                .publish(RoomEvent {
                    room: self.address.clone(),
                    origin: self.ctx.node,
                    payload,
                })
                .await;
        }
    }

    /// Save the room if it is persistent. Failures are logged; in-memory
    /// state stays authoritative.
    async fn save(&self) {
        let snapshot = {
            let state = self.state.read().await;
            if !state.config.persistent {
                return;
            }
            self.snapshot_locked(&state)
        };
        if let Err(error) = self.ctx.gateway.save_room(&snapshot).await {
            warn!(room = %self.address, %error, "failed to save room");
        }
    }

    fn require_owner(&self, state: &RoomState, actor: &BareJid) -> Result<(), MucError> {
        if self.ctx.config.is_sysadmin(actor)
            || state.affiliations.is_owner(actor, self.ctx.groups.as_ref())
        {
            Ok(())
        } else {
            Err(MucError::Forbidden)
        }
    }

    /// Deliver a presence announcement to local sessions.
    fn fanout_presence(&self, state: &RoomState, ann: Announcement<'_>) {
        let subject_bare = ann.real.to_bare();
        for (_, recipient) in state.roster.iter() {
            if !recipient.is_local() {
                continue;
            }
            let is_self = recipient.bare() == subject_bare;
            if !ann.room_wide && !is_self {
                continue;
            }
            let reveal =
                state.config.anyone_can_discover_jid || recipient.role == Role::Moderator;
            let mut codes = ann.statuses.to_vec();
            if is_self {
                codes.extend_from_slice(ann.self_statuses);
            }
            let mut presence = build_presence(PresenceSpec {
                base: ann.base,
                from: ann.occupant_jid.clone(),
                affiliation: ann.affiliation,
                role: ann.role,
                real_jid: reveal.then_some(ann.real),
                new_nick: ann.new_nick,
                reason: ann.reason,
                statuses: &codes,
            });
            presence.to = Some(Jid::from(recipient.user.clone()));
            recipient.send(Stanza::Presence(presence));
        }
    }

    /// Deliver a groupchat message to every non-deaf local session.
    fn deliver_message(&self, state: &RoomState, message: &Message) {
        for (_, recipient) in state.roster.iter() {
            if !recipient.is_local() || recipient.deaf {
                continue;
            }
            let mut copy = message.clone();
            copy.to = Some(Jid::from(recipient.user.clone()));
            recipient.send(Stanza::Message(copy));
        }
    }

    /// Send every existing occupant's presence to a (re)joining session.
    fn send_initial_presences(&self, state: &RoomState, joiner_id: OccupantId) {
        let Some(joiner) = state.roster.get(joiner_id) else {
            return;
        };
        if !joiner.is_local() {
            return;
        }
        let reveal =
            state.config.anyone_can_discover_jid || joiner.role == Role::Moderator;
        for (id, occ) in state.roster.iter() {
            if id == joiner_id {
                continue;
            }
            if !state.config.roles_to_broadcast_presence.contains(&occ.role) {
                continue;
            }
            let Ok(from) = self.occupant_jid(&occ.nickname) else {
                continue;
            };
            let mut presence = build_presence(PresenceSpec {
                base: &occ.presence,
                from,
                affiliation: occ.affiliation,
                role: occ.role,
                real_jid: reveal.then(|| &occ.user),
                new_nick: None,
                reason: None,
                statuses: &[],
            });
            presence.to = Some(Jid::from(joiner.user.clone()));
            joiner.send(Stanza::Presence(presence));
        }
    }

    /// Replay history and the current subject to a joining session.
    fn send_history(
        &self,
        state: &RoomState,
        joiner: &FullJid,
        sink: &StanzaSink,
        request: Option<&HistoryRequest>,
    ) {
        let room = Jid::from(self.address.clone());
        for mut message in state.history.replay(&room, request) {
            message.to = Some(Jid::from(joiner.clone()));
            let _ = sink.send(Stanza::Message(message));
        }
        let mut subject = match state.history.changed_subject() {
            Some(message) => message.clone(),
            None => {
                let mut message = Message::new(None::<Jid>);
                message.type_ = MessageType::Groupchat;
                message.from = Some(room);
                message
                    .subjects
                    .insert(String::new(), Subject(state.subject.clone()));
                message
            }
        };
        subject.to = Some(Jid::from(joiner.clone()));
        let _ = sink.send(Stanza::Message(subject));
    }

    /// Record emptiness after a removal; a non-persistent room that just
    /// emptied is destroyed (originator-side lifecycle decision).
    fn note_emptiness_locked(
        &self,
        state: &mut RoomState,
        payloads: &mut Vec<EventPayload>,
    ) -> (bool, bool) {
        if !state.roster.is_empty() {
            return (false, false);
        }
        if state.config.persistent {
            state.empty_since = Some(Utc::now());
            (true, false)
        } else {
            state.destroyed = true;
            payloads.push(EventPayload::RoomDestroyed {
                alternate: None,
                reason: None,
            });
            (true, true)
        }
    }

    /// Evict every occupant with a destroy presence and clear the roster.
    fn evict_all_locked(
        &self,
        state: &mut RoomState,
        alternate: Option<&BareJid>,
        reason: Option<&str>,
    ) {
        for id in state.roster.ids() {
            let Some(occ) = state.roster.remove(id) else {
                continue;
            };
            if !occ.is_local() {
                continue;
            }
            let Ok(from) = self.occupant_jid(&occ.nickname) else {
                continue;
            };
            let mut presence = destroy_presence(from, alternate, reason);
            presence.to = Some(Jid::from(occ.user.clone()));
            occ.send(Stanza::Presence(presence));
        }
    }

    /// Shared tail of every mutating operation: replication first, then the
    /// originator-only side effects.
    async fn after_mutation(
        &self,
        payloads: Vec<EventPayload>,
        kicked: Vec<(FullJid, String)>,
        emptied: bool,
        destroyed: bool,
    ) {
        self.publish(payloads).await;
        for (user, nickname) in &kicked {
            self.ctx.hooks.occupant_left(&self.address, user, nickname).await;
        }
        if emptied {
            self.ctx.hooks.room_emptied(&self.address).await;
        }
        if destroyed {
            self.ctx.hooks.room_destroyed(&self.address).await;
        }
        if emptied && !destroyed {
            self.save().await;
        }
    }
}

impl Room {
    /// Join the room under a nickname.
    ///
    /// Validation order: delegate veto, destroyed room / occupancy limit
    /// (waived for owners and admins), lock (owners only), nickname held by
    /// another user, password, nickname reserved by another member,
    /// reserved-nickname login restriction, then affiliation/role
    /// derivation. A session already joined under the same nickname is
    /// refreshed in place and has the room replayed to it.
    #[instrument(skip_all, fields(room = %self.address, nickname, user = %user))]
    pub async fn join(
        &self,
        nickname: &str,
        password: Option<&str>,
        history: Option<&HistoryRequest>,
        user: &FullJid,
        presence: Presence,
        sink: StanzaSink,
    ) -> Result<OccupantSnapshot, MucError> {
        if !self.ctx.hooks.joining_allowed(&self.address, user).await {
            return Err(MucError::Unauthorized);
        }
        let occupant_jid = self.occupant_jid(nickname)?;
        let bare = user.to_bare();
        let groups = self.ctx.groups.as_ref();

        let mut presence = presence;
        let deaf = presence.payloads.iter().any(|payload| {
            payload.is("x", NS_DEAF_OCCUPANT)
                && payload.children().any(|child| child.name() == "deaf-occupant")
        });
        presence
            .payloads
            .retain(|payload| !payload.is("x", NS_MUC) && !payload.is("x", NS_MUC_USER));

        let (snapshot, payloads, fresh) = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            let is_sysadmin = self.ctx.config.is_sysadmin(&bare);
            let is_owner = is_sysadmin || state.affiliations.is_owner(&bare, groups);
            let privileged = is_owner || state.affiliations.is_admin(&bare, groups);

            if let Some(existing) = state.roster.by_full(user) {
                let same_nick = state
                    .roster
                    .get(existing)
                    .map(|occ| occ.nickname.to_lowercase() == nickname.to_lowercase())
                    .unwrap_or(false);
                if !same_nick {
                    // Already joined under another nickname; that is a
                    // nickname change, not a second join.
                    return Err(MucError::NotAcceptable);
                }
                // Client-only join: the session came back (or re-sent its
                // join); refresh the plumbing and replay the room.
                if let Some(occ) = state.roster.get_mut(existing) {
                    occ.location = Location::Local { sink: sink.clone() };
                    occ.presence = presence.clone();
                }
                let snapshot = state
                    .roster
                    .get(existing)
                    .map(Occupant::snapshot)
                    .ok_or(MucError::ServiceUnavailable)?;
                self.send_initial_presences(&state, existing);
                let mut self_statuses = vec![110];
                if state.config.anyone_can_discover_jid {
                    self_statuses.push(100);
                }
                self.fanout_presence(
                    &state,
                    Announcement {
                        occupant_jid,
                        real: user,
                        affiliation: snapshot.affiliation,
                        role: snapshot.role,
                        base: &presence,
                        statuses: &[],
                        self_statuses: &self_statuses,
                        new_nick: None,
                        reason: None,
                        room_wide: false,
                    },
                );
                self.send_history(&state, user, &sink, history);
                (
                    snapshot,
                    vec![EventPayload::PresenceUpdated {
                        user: user.clone(),
                        presence: presence.clone(),
                    }],
                    false,
                )
            } else {
                let limit = state.config.max_occupants;
                if limit > 0 && state.roster.len() >= limit as usize && !privileged {
                    return Err(MucError::ServiceUnavailable);
                }
                if state.locked_since.is_some() && !is_owner {
                    return Err(MucError::RoomLocked);
                }
                for id in state.roster.by_nickname(nickname) {
                    if let Some(occ) = state.roster.get(id) {
                        if occ.bare() != bare {
                            return Err(MucError::Conflict);
                        }
                    }
                }
                if let Some(expected) = state.config.password.as_deref() {
                    if password != Some(expected) {
                        return Err(MucError::Unauthorized);
                    }
                }
                if let Some(holder) = state.affiliations.member_with_nickname(nickname) {
                    if *holder != bare {
                        return Err(MucError::Conflict);
                    }
                }
                if state.config.nickname_login_restricted {
                    if let Some(reserved) = state.affiliations.reserved_nickname(&bare) {
                        if reserved != nickname.to_lowercase() {
                            return Err(MucError::NotAcceptable);
                        }
                    }
                }
                let (affiliation, role) = derive_membership(
                    &state.affiliations,
                    &state.config,
                    is_sysadmin,
                    groups,
                    &bare,
                )?;

                let id = state.roster.insert(Occupant {
                    nickname: nickname.to_string(),
                    user: user.clone(),
                    role,
                    affiliation,
                    presence: presence.clone(),
                    location: Location::Local { sink: sink.clone() },
                    deaf,
                });
                state.empty_since = None;
                let snapshot = state
                    .roster
                    .get(id)
                    .map(Occupant::snapshot)
                    .ok_or(MucError::ServiceUnavailable)?;

                self.send_initial_presences(&state, id);
                let mut self_statuses = vec![110];
                if state.config.anyone_can_discover_jid {
                    self_statuses.push(100);
                }
                if state.just_created {
                    self_statuses.push(201);
                }
                state.just_created = false;
                self.fanout_presence(
                    &state,
                    Announcement {
                        occupant_jid,
                        real: user,
                        affiliation,
                        role,
                        base: &presence,
                        statuses: &[],
                        self_statuses: &self_statuses,
                        new_nick: None,
                        reason: None,
                        room_wide: state.config.broadcasts_role(role),
                    },
                );
                self.send_history(&state, user, &sink, history);
                (
                    snapshot,
                    vec![EventPayload::OccupantJoined {
                        occupant: OccupantData {
                            nickname: nickname.to_string(),
                            user: user.clone(),
                            role,
                            affiliation,
                            presence: presence.clone(),
                            node: self.ctx.node,
                        },
                    }],
                    true,
                )
            }
        };

        self.publish(payloads).await;
        if fresh {
            self.ctx
                .hooks
                .occupant_joined(&self.address, user, nickname)
                .await;
            info!("occupant joined");
        }
        Ok(snapshot)
    }

    /// Leave the room.
    ///
    /// The departure is announced room-wide only when this was the last
    /// session under the nickname and the occupant's role was being
    /// broadcast; otherwise only the leaving session is told. A
    /// non-persistent room that empties is destroyed.
    #[instrument(skip_all, fields(room = %self.address, user = %user))]
    pub async fn leave(&self, user: &FullJid) -> Result<(), MucError> {
        let (payloads, nickname, emptied, destroyed) = {
            let mut state = self.state.write().await;
            let Some(id) = state.roster.by_full(user) else {
                return Err(MucError::ItemNotFound(user.to_string()));
            };
            let Some(occupant) = state.roster.remove(id) else {
                return Err(MucError::ItemNotFound(user.to_string()));
            };
            let last_session = !state.roster.has_nickname(&occupant.nickname);
            let room_wide = last_session
                && state
                    .config
                    .roles_to_broadcast_presence
                    .contains(&occupant.role);
            let from = self.occupant_jid(&occupant.nickname)?;
            let base = Presence::new(PresenceType::Unavailable);

            let mut echo = build_presence(PresenceSpec {
                base: &base,
                from: from.clone(),
                affiliation: occupant.affiliation,
                role: Role::None,
                real_jid: None,
                new_nick: None,
                reason: None,
                statuses: &[110],
            });
            echo.to = Some(Jid::from(occupant.user.clone()));
            occupant.send(Stanza::Presence(echo));

            if room_wide {
                self.fanout_presence(
                    &state,
                    Announcement {
                        occupant_jid: from,
                        real: &occupant.user,
                        affiliation: occupant.affiliation,
                        role: Role::None,
                        base: &base,
                        statuses: &[],
                        self_statuses: &[110],
                        new_nick: None,
                        reason: None,
                        room_wide: true,
                    },
                );
            }

            let mut payloads = vec![EventPayload::OccupantLeft {
                user: occupant.user.clone(),
                nickname: occupant.nickname.clone(),
                statuses: vec![],
                reason: None,
            }];
            let (emptied, destroyed) = self.note_emptiness_locked(&mut state, &mut payloads);
            (payloads, occupant.nickname.clone(), emptied, destroyed)
        };

        self.publish(payloads).await;
        self.ctx.hooks.occupant_left(&self.address, user, &nickname).await;
        if emptied {
            self.ctx.hooks.room_emptied(&self.address).await;
        }
        if destroyed {
            self.ctx.hooks.room_destroyed(&self.address).await;
        }
        if emptied && !destroyed {
            self.save().await;
        }
        debug!("occupant left");
        Ok(())
    }

    /// Record and rebroadcast an occupant's availability update.
    pub async fn presence_updated(
        &self,
        user: &FullJid,
        presence: Presence,
    ) -> Result<(), MucError> {
        let mut presence = presence;
        presence
            .payloads
            .retain(|payload| !payload.is("x", NS_MUC) && !payload.is("x", NS_MUC_USER));
        let payloads = {
            let mut state = self.state.write().await;
            let Some(id) = state.roster.by_full(user) else {
                return Err(MucError::ItemNotFound(user.to_string()));
            };
            let Some(occ) = state.roster.get_mut(id) else {
                return Err(MucError::ItemNotFound(user.to_string()));
            };
            occ.presence = presence.clone();
            let (nickname, affiliation, role) = (occ.nickname.clone(), occ.affiliation, occ.role);
            let from = self.occupant_jid(&nickname)?;
            self.fanout_presence(
                &state,
                Announcement {
                    occupant_jid: from,
                    real: user,
                    affiliation,
                    role,
                    base: &presence,
                    statuses: &[],
                    self_statuses: &[110],
                    new_nick: None,
                    reason: None,
                    room_wide: state.config.roles_to_broadcast_presence.contains(&role),
                },
            );
            vec![EventPayload::PresenceUpdated {
                user: user.clone(),
                presence,
            }]
        };
        self.publish(payloads).await;
        Ok(())
    }

    /// Switch an occupant to a new nickname.
    ///
    /// The old nickname is retired with an unavailable presence carrying
    /// status 303 and the new nick, immediately followed by the occupant's
    /// presence under the new nickname. The re-index is atomic: no lookup
    /// can observe the occupant under both (or neither) nickname.
    pub async fn change_nickname(
        &self,
        user: &FullJid,
        new_nickname: &str,
        presence: Presence,
    ) -> Result<(), MucError> {
        let new_jid = self.occupant_jid(new_nickname)?;
        let mut presence = presence;
        presence
            .payloads
            .retain(|payload| !payload.is("x", NS_MUC) && !payload.is("x", NS_MUC_USER));
        let (payloads, old_nickname) = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            if !state.config.change_nickname_allowed {
                return Err(MucError::NotAcceptable);
            }
            let Some(id) = state.roster.by_full(user) else {
                return Err(MucError::ItemNotFound(user.to_string()));
            };
            let bare = user.to_bare();
            for other in state.roster.by_nickname(new_nickname) {
                if other != id {
                    if let Some(occ) = state.roster.get(other) {
                        if occ.bare() != bare {
                            return Err(MucError::Conflict);
                        }
                    }
                }
            }
            if let Some(holder) = state.affiliations.member_with_nickname(new_nickname) {
                if *holder != bare {
                    return Err(MucError::Conflict);
                }
            }
            let Some(occ) = state.roster.get(id) else {
                return Err(MucError::ItemNotFound(user.to_string()));
            };
            let old_nickname = occ.nickname.clone();
            let (affiliation, role) = (occ.affiliation, occ.role);
            let old_jid = self.occupant_jid(&old_nickname)?;
            let room_wide = state.config.roles_to_broadcast_presence.contains(&role);

            let unavailable = Presence::new(PresenceType::Unavailable);
            self.fanout_presence(
                &state,
                Announcement {
                    occupant_jid: old_jid,
                    real: user,
                    affiliation,
                    role,
                    base: &unavailable,
                    statuses: &[303],
                    self_statuses: &[110],
                    new_nick: Some(new_nickname),
                    reason: None,
                    room_wide,
                },
            );
            state.roster.rename(id, new_nickname);
            if let Some(occ) = state.roster.get_mut(id) {
                occ.presence = presence.clone();
            }
            self.fanout_presence(
                &state,
                Announcement {
                    occupant_jid: new_jid,
                    real: user,
                    affiliation,
                    role,
                    base: &presence,
                    statuses: &[],
                    self_statuses: &[110],
                    new_nick: None,
                    reason: None,
                    room_wide,
                },
            );
            (
                vec![EventPayload::NicknameChanged {
                    user: user.clone(),
                    old_nickname: old_nickname.clone(),
                    new_nickname: new_nickname.to_string(),
                    presence,
                }],
                old_nickname,
            )
        };
        self.publish(payloads).await;
        self.ctx
            .hooks
            .nickname_changed(&self.address, user, &old_nickname, new_nickname)
            .await;
        Ok(())
    }
}

impl Room {
    /// Broadcast a groupchat message from an occupant.
    ///
    /// Moderated rooms require at least participant (voice). The message is
    /// appended to history on every node; only the originating node queues
    /// it for the conversation log.
    pub async fn broadcast_message(
        &self,
        sender: &FullJid,
        message: Message,
    ) -> Result<(), MucError> {
        let (payloads, row, nickname) = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            let Some(id) = state.roster.by_full(sender) else {
                return Err(MucError::Forbidden);
            };
            let Some(occ) = state.roster.get(id) else {
                return Err(MucError::Forbidden);
            };
            if state.config.moderated && occ.role < Role::Participant {
                return Err(MucError::Forbidden);
            }
            let nickname = occ.nickname.clone();
            let from = self.occupant_jid(&nickname)?;

            let mut message = message;
            message.from = Some(Jid::from(from));
            message.to = None;
            message.type_ = MessageType::Groupchat;
            if message.id.is_none() {
                message.id = Some(Uuid::new_v4().to_string());
            }
            let stamp = Utc::now();
            state.history.add_message(message.clone(), stamp);
            self.deliver_message(&state, &message);

            let row = state.config.logging_enabled.then(|| HistoryRow {
                room: self.address.clone(),
                sender: sender.to_bare(),
                nickname: nickname.clone(),
                stamp,
                subject: None,
                body: message.bodies.values().next().map(|body| body.0.clone()),
            });
            (
                vec![EventPayload::MessageBroadcast { message }],
                row,
                nickname,
            )
        };
        if let Some(row) = row {
            self.ctx.log.enqueue(row);
        }
        self.publish(payloads).await;
        self.ctx
            .hooks
            .message_received(&self.address, sender, &nickname)
            .await;
        Ok(())
    }

    /// Change the room subject.
    ///
    /// Moderators always may; other occupants only with voice and when the
    /// room allows occupant subject changes.
    pub async fn change_subject(&self, actor: &FullJid, subject: &str) -> Result<(), MucError> {
        let payloads = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            let Some(id) = state.roster.by_full(actor) else {
                return Err(MucError::Forbidden);
            };
            let Some(occ) = state.roster.get(id) else {
                return Err(MucError::Forbidden);
            };
            let allowed = occ.role == Role::Moderator
                || (state.config.occupants_can_change_subject && occ.role >= Role::Participant);
            if !allowed {
                return Err(MucError::Forbidden);
            }
            let from = self.occupant_jid(&occ.nickname)?;

            let mut message = Message::new(None::<Jid>);
            message.type_ = MessageType::Groupchat;
            message.id = Some(Uuid::new_v4().to_string());
            message.from = Some(Jid::from(from));
            message
                .subjects
                .insert(String::new(), Subject(subject.to_string()));

            state.subject = subject.to_string();
            state.history.add_message(message.clone(), Utc::now());
            self.deliver_message(&state, &message);
            vec![EventPayload::MessageBroadcast { message }]
        };
        self.publish(payloads).await;
        self.ctx.hooks.subject_changed(&self.address, subject).await;
        Ok(())
    }

    /// Relay a private message to every session joined under a nickname.
    ///
    /// The sender must clear the room's private-message policy; sessions
    /// hosted on other nodes are reached through the synchronous delivery
    /// request, outside the room lock.
    pub async fn send_private_message(
        &self,
        sender: &FullJid,
        to_nickname: &str,
        message: Message,
    ) -> Result<(), MucError> {
        let remote = {
            let state = self.state.read().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            let Some(sender_id) = state.roster.by_full(sender) else {
                return Err(MucError::Forbidden);
            };
            let Some(sender_occ) = state.roster.get(sender_id) else {
                return Err(MucError::Forbidden);
            };
            let minimum = state
                .config
                .private_message_policy
                .minimum_role()
                .ok_or(MucError::Forbidden)?;
            if sender_occ.role < minimum {
                return Err(MucError::Forbidden);
            }
            let targets = state.roster.by_nickname(to_nickname);
            if targets.is_empty() {
                return Err(MucError::ItemNotFound(to_nickname.to_string()));
            }
            let from = self.occupant_jid(&sender_occ.nickname)?;
            let mut message = message;
            message.from = Some(Jid::from(from));

            let mut remote = Vec::new();
            for id in targets {
                let Some(occ) = state.roster.get(id) else {
                    continue;
                };
                let mut copy = message.clone();
                copy.to = Some(Jid::from(occ.user.clone()));
                match occ.node() {
                    None => occ.send(Stanza::Message(copy)),
                    Some(node) => remote.push((
                        node,
                        OccupantRequest {
                            room: self.address.clone(),
                            user: occ.user.clone(),
                            update: OccupantUpdate::Deliver {
                                stanza: Stanza::Message(copy),
                            },
                        },
                    )),
                }
            }
            remote
        };
        for (node, request) in remote {
            if let Err(error) = update_remote_occupant(
                self.ctx.bus.as_ref(),
                self.ctx.config.remote_call_timeout,
                node,
                request,
            )
            .await
            {
                warn!(room = %self.address, %node, %error, "failed to relay private message");
            }
        }
        Ok(())
    }

    /// Broadcast a message from the room's own address.
    pub async fn server_broadcast(&self, text: &str) {
        let payloads = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return;
            }
            let mut message = Message::new(None::<Jid>);
            message.type_ = MessageType::Groupchat;
            message.id = Some(Uuid::new_v4().to_string());
            message.from = Some(Jid::from(self.address.clone()));
            message.bodies.insert(String::new(), Body(text.to_string()));
            state.history.add_message(message.clone(), Utc::now());
            self.deliver_message(&state, &message);
            vec![EventPayload::MessageBroadcast { message }]
        };
        self.publish(payloads).await;
    }
}

impl Room {
    /// Grant an affiliation to a bare JID (an individual or a group).
    ///
    /// Owner-list changes take an owner; everything else takes admin or
    /// better. The room is never left without an explicit owner. Every
    /// present occupant the entry covers is re-derived: demotions become
    /// presence updates, lost access becomes a kick (301 for a ban, 321
    /// for a now members-only room). Returns the presences broadcast for
    /// the affected occupants.
    #[instrument(skip_all, fields(room = %self.address, target = %target, affiliation = %new_affiliation))]
    pub async fn change_affiliation(
        &self,
        actor: &BareJid,
        target: &BareJid,
        new_affiliation: Affiliation,
        reserved_nickname: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Vec<Presence>, MucError> {
        let groups = self.ctx.groups.as_ref();
        let (updates, payloads, old, persistent, kicked, emptied, destroyed) = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            let actor_affiliation = if self.ctx.config.is_sysadmin(actor)
                || state.affiliations.is_owner(actor, groups)
            {
                Affiliation::Owner
            } else if state.affiliations.is_admin(actor, groups) {
                Affiliation::Admin
            } else if state.affiliations.is_member(actor, groups) {
                Affiliation::Member
            } else {
                Affiliation::None
            };
            let old = state.affiliations.direct_affiliation(target);
            authorize_affiliation_change(actor_affiliation, old, new_affiliation, &state.config)?;
            if old == Affiliation::Owner
                && new_affiliation != Affiliation::Owner
                && state.affiliations.is_last_owner(target)
            {
                return Err(MucError::Conflict);
            }
            if new_affiliation == Affiliation::Member {
                if let Some(nickname) = reserved_nickname {
                    if let Some(holder) = state.affiliations.member_with_nickname(nickname) {
                        if holder != target {
                            return Err(MucError::Conflict);
                        }
                    }
                    for id in state.roster.by_nickname(nickname) {
                        if let Some(occ) = state.roster.get(id) {
                            if occ.bare() != *target {
                                return Err(MucError::Conflict);
                            }
                        }
                    }
                }
            }

            state
                .affiliations
                .apply(target, new_affiliation, reserved_nickname);
            state.modified_at = Utc::now();
            let mut payloads = vec![match new_affiliation {
                Affiliation::Member => EventPayload::MemberAdded {
                    jid: target.clone(),
                    reserved_nickname: reserved_nickname.unwrap_or_default().to_lowercase(),
                },
                other => EventPayload::AffiliationAdded {
                    jid: target.clone(),
                    affiliation: other,
                },
            }];

            // Re-derive everyone the entry covers. A group entry fans out
            // to every present member of the group.
            let affected: Vec<BareJid> = if groups.is_group(target) {
                groups.members_of(target).into_iter().collect()
            } else {
                vec![target.clone()]
            };
            let mut updates = Vec::new();
            let mut kicked = Vec::new();
            self.reconcile_occupants_locked(
                &mut state,
                Some(&affected),
                reason,
                &mut updates,
                &mut kicked,
                &mut payloads,
            );
            // Only an eviction can change the emptiness of the room here.
            let (emptied, destroyed) = if kicked.is_empty() {
                (false, false)
            } else {
                self.note_emptiness_locked(&mut state, &mut payloads)
            };
            (
                updates,
                payloads,
                old,
                state.config.persistent,
                kicked,
                emptied,
                destroyed,
            )
        };

        if persistent {
            let result = if new_affiliation == Affiliation::None {
                self.ctx
                    .gateway
                    .remove_affiliation(&self.address, target, old)
                    .await
            } else {
                self.ctx
                    .gateway
                    .save_affiliation(&self.address, target, reserved_nickname, new_affiliation, old)
                    .await
            };
            if let Err(error) = result {
                warn!(room = %self.address, %target, %error, "failed to persist affiliation");
            }
        }
        self.after_mutation(payloads, kicked, emptied, destroyed).await;
        Ok(updates)
    }

    /// Re-derive role and affiliation for present occupants.
    ///
    /// `affected` limits the pass to the given bare JIDs; `None` covers the
    /// whole roster (a room-mode change). Occupants whose derivation now
    /// rejects are kicked; the rest get a presence update when anything
    /// actually changed.
    fn reconcile_occupants_locked(
        &self,
        state: &mut RoomState,
        affected: Option<&[BareJid]>,
        reason: Option<&str>,
        updates: &mut Vec<Presence>,
        kicked: &mut Vec<(FullJid, String)>,
        payloads: &mut Vec<EventPayload>,
    ) {
        let groups = self.ctx.groups.as_ref();
        for id in state.roster.ids() {
            let Some(occ) = state.roster.get(id) else {
                continue;
            };
            let bare = occ.bare();
            if let Some(affected) = affected {
                if !affected.contains(&bare) {
                    continue;
                }
            }
            let is_sysadmin = self.ctx.config.is_sysadmin(&bare);
            match reconcile_membership(&state.affiliations, &state.config, is_sysadmin, groups, &bare)
            {
                Reconciled::Stay(affiliation, role) => {
                    let Some(occ) = state.roster.get_mut(id) else {
                        continue;
                    };
                    if occ.affiliation == affiliation && occ.role == role {
                        continue;
                    }
                    occ.affiliation = affiliation;
                    occ.role = role;
                    let user = occ.user.clone();
                    let nickname = occ.nickname.clone();
                    let base = occ.presence.clone();
                    let Ok(from) = self.occupant_jid(&nickname) else {
                        continue;
                    };
                    updates.push(build_presence(PresenceSpec {
                        base: &base,
                        from: from.clone(),
                        affiliation,
                        role,
                        real_jid: Some(&user),
                        new_nick: None,
                        reason: None,
                        statuses: &[],
                    }));
                    self.fanout_presence(
                        state,
                        Announcement {
                            occupant_jid: from,
                            real: &user,
                            affiliation,
                            role,
                            base: &base,
                            statuses: &[],
                            self_statuses: &[110],
                            new_nick: None,
                            reason: None,
                            room_wide: state.config.broadcasts_role(role),
                        },
                    );
                    payloads.push(EventPayload::OccupantUpdated {
                        user,
                        role,
                        affiliation,
                    });
                }
                Reconciled::Kick(affiliation, code) => {
                    let Some(occ) = state.roster.remove(id) else {
                        continue;
                    };
                    let Ok(from) = self.occupant_jid(&occ.nickname) else {
                        continue;
                    };
                    let base = Presence::new(PresenceType::Unavailable);
                    let mut echo = build_presence(PresenceSpec {
                        base: &base,
                        from: from.clone(),
                        affiliation,
                        role: Role::None,
                        real_jid: None,
                        new_nick: None,
                        reason,
                        statuses: &[code, 110],
                    });
                    echo.to = Some(Jid::from(occ.user.clone()));
                    occ.send(Stanza::Presence(echo));
                    updates.push(build_presence(PresenceSpec {
                        base: &base,
                        from: from.clone(),
                        affiliation,
                        role: Role::None,
                        real_jid: Some(&occ.user),
                        new_nick: None,
                        reason,
                        statuses: &[code],
                    }));
                    self.fanout_presence(
                        state,
                        Announcement {
                            occupant_jid: from,
                            real: &occ.user,
                            affiliation,
                            role: Role::None,
                            base: &base,
                            statuses: &[code],
                            self_statuses: &[],
                            new_nick: None,
                            reason,
                            room_wide: true,
                        },
                    );
                    payloads.push(EventPayload::OccupantLeft {
                        user: occ.user.clone(),
                        nickname: occ.nickname.clone(),
                        statuses: vec![code],
                        reason: reason.map(String::from),
                    });
                    kicked.push((occ.user.clone(), occ.nickname.clone()));
                }
            }
        }
    }

    /// Change an occupant's role: grant or revoke voice or moderatorship,
    /// or kick with `Role::None` (status 307).
    ///
    /// Seniority rules: only moderators act, admins cannot touch owners,
    /// and granting moderatorship takes an admin or owner. A target hosted
    /// on another node is mutated through the synchronous cluster call,
    /// issued outside the room lock; a rejection, timeout, or transport
    /// failure surfaces as `NotAllowed` with no local mutation.
    #[instrument(skip_all, fields(room = %self.address, target = %target, role = %new_role))]
    pub async fn change_role(
        &self,
        actor: &FullJid,
        target: &FullJid,
        new_role: Role,
        reason: Option<&str>,
    ) -> Result<Presence, MucError> {
        enum Step {
            Done(Presence, Vec<EventPayload>, Vec<(FullJid, String)>, bool, bool),
            Remote(NodeId, OccupantRequest),
        }
        let step = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            let Some(actor_id) = state.roster.by_full(actor) else {
                return Err(MucError::Forbidden);
            };
            let Some(actor_occ) = state.roster.get(actor_id) else {
                return Err(MucError::Forbidden);
            };
            let (actor_affiliation, actor_role) = (actor_occ.affiliation, actor_occ.role);
            let Some(target_id) = state.roster.by_full(target) else {
                return Err(MucError::ItemNotFound(target.to_string()));
            };
            let Some(target_occ) = state.roster.get(target_id) else {
                return Err(MucError::ItemNotFound(target.to_string()));
            };
            if !may_change_role(actor_affiliation, actor_role, target_occ.affiliation) {
                return Err(MucError::NotAllowed);
            }
            if new_role == Role::Moderator && actor_affiliation < Affiliation::Admin {
                return Err(MucError::NotAllowed);
            }
            match target_occ.node() {
                Some(node) => Step::Remote(
                    node,
                    OccupantRequest {
                        room: self.address.clone(),
                        user: target.clone(),
                        update: OccupantUpdate::SetRole {
                            role: new_role,
                            reason: reason.map(String::from),
                        },
                    },
                ),
                None => {
                    let mut payloads = Vec::new();
                    let mut kicked = Vec::new();
                    let presence = self.apply_role_locked(
                        &mut state,
                        target_id,
                        new_role,
                        reason,
                        &mut payloads,
                        &mut kicked,
                    )?;
                    let (emptied, destroyed) =
                        self.note_emptiness_locked(&mut state, &mut payloads);
                    Step::Done(presence, payloads, kicked, emptied, destroyed)
                }
            }
        };

        match step {
            Step::Done(presence, payloads, kicked, emptied, destroyed) => {
                self.after_mutation(payloads, kicked, emptied, destroyed).await;
                Ok(presence)
            }
            Step::Remote(node, request) => {
                // The hosting node validates nothing further; it applies the
                // change and replicates it itself. Absence of an answer is a
                // rejection.
                let presence = update_remote_occupant(
                    self.ctx.bus.as_ref(),
                    self.ctx.config.remote_call_timeout,
                    node,
                    request,
                )
                .await?;
                // Mirror the accepted change on this node's replica rather
                // than waiting for the replicated event to come around.
                let mut state = self.state.write().await;
                if let Some(id) = state.roster.by_full(target) {
                    if new_role == Role::None {
                        if let Some(occ) = state.roster.remove(id) {
                            let Ok(from) = self.occupant_jid(&occ.nickname) else {
                                return Ok(presence);
                            };
                            let base = Presence::new(PresenceType::Unavailable);
                            self.fanout_presence(
                                &state,
                                Announcement {
                                    occupant_jid: from,
                                    real: &occ.user,
                                    affiliation: occ.affiliation,
                                    role: Role::None,
                                    base: &base,
                                    statuses: &[307],
                                    self_statuses: &[],
                                    new_nick: None,
                                    reason,
                                    room_wide: true,
                                },
                            );
                        }
                    } else if let Some(occ) = state.roster.get_mut(id) {
                        occ.role = new_role;
                        let (user, nickname, affiliation, base) = (
                            occ.user.clone(),
                            occ.nickname.clone(),
                            occ.affiliation,
                            occ.presence.clone(),
                        );
                        let Ok(from) = self.occupant_jid(&nickname) else {
                            return Ok(presence);
                        };
                        self.fanout_presence(
                            &state,
                            Announcement {
                                occupant_jid: from,
                                real: &user,
                                affiliation,
                                role: new_role,
                                base: &base,
                                statuses: &[],
                                self_statuses: &[110],
                                new_nick: None,
                                reason: None,
                                room_wide: state.config.broadcasts_role(new_role),
                            },
                        );
                    }
                }
                Ok(presence)
            }
        }
    }

    /// Apply a role change to a local occupant under the write lock.
    fn apply_role_locked(
        &self,
        state: &mut RoomState,
        id: OccupantId,
        new_role: Role,
        reason: Option<&str>,
        payloads: &mut Vec<EventPayload>,
        kicked: &mut Vec<(FullJid, String)>,
    ) -> Result<Presence, MucError> {
        if new_role == Role::None {
            let Some(occ) = state.roster.remove(id) else {
                return Err(MucError::NotAllowed);
            };
            let Ok(from) = self.occupant_jid(&occ.nickname) else {
                return Err(MucError::NotAllowed);
            };
            let base = Presence::new(PresenceType::Unavailable);
            let mut echo = build_presence(PresenceSpec {
                base: &base,
                from: from.clone(),
                affiliation: occ.affiliation,
                role: Role::None,
                real_jid: None,
                new_nick: None,
                reason,
                statuses: &[307, 110],
            });
            echo.to = Some(Jid::from(occ.user.clone()));
            occ.send(Stanza::Presence(echo));
            self.fanout_presence(
                state,
                Announcement {
                    occupant_jid: from.clone(),
                    real: &occ.user,
                    affiliation: occ.affiliation,
                    role: Role::None,
                    base: &base,
                    statuses: &[307],
                    self_statuses: &[],
                    new_nick: None,
                    reason,
                    room_wide: true,
                },
            );
            payloads.push(EventPayload::OccupantLeft {
                user: occ.user.clone(),
                nickname: occ.nickname.clone(),
                statuses: vec![307],
                reason: reason.map(String::from),
            });
            kicked.push((occ.user.clone(), occ.nickname.clone()));
            Ok(build_presence(PresenceSpec {
                base: &base,
                from,
                affiliation: occ.affiliation,
                role: Role::None,
                real_jid: Some(&occ.user),
                new_nick: None,
                reason,
                statuses: &[307],
            }))
        } else {
            let Some(occ) = state.roster.get_mut(id) else {
                return Err(MucError::NotAllowed);
            };
            occ.role = new_role;
            let (user, nickname, affiliation, base) = (
                occ.user.clone(),
                occ.nickname.clone(),
                occ.affiliation,
                occ.presence.clone(),
            );
            let Ok(from) = self.occupant_jid(&nickname) else {
                return Err(MucError::NotAllowed);
            };
            self.fanout_presence(
                state,
                Announcement {
                    occupant_jid: from.clone(),
                    real: &user,
                    affiliation,
                    role: new_role,
                    base: &base,
                    statuses: &[],
                    self_statuses: &[110],
                    new_nick: None,
                    reason: None,
                    room_wide: state.config.broadcasts_role(new_role),
                },
            );
            payloads.push(EventPayload::OccupantUpdated {
                user: user.clone(),
                role: new_role,
                affiliation,
            });
            Ok(build_presence(PresenceSpec {
                base: &base,
                from,
                affiliation,
                role: new_role,
                real_jid: Some(&user),
                new_nick: None,
                reason: None,
                statuses: &[],
            }))
        }
    }

    /// Execute a synchronous request from another node against an occupant
    /// this node hosts.
    ///
    /// The requesting node already validated permissions; this node applies
    /// the change, fans it out locally, replicates it, and answers with the
    /// occupant's resulting presence. Any failure is reported as
    /// `NotAllowed`; the caller treats an absent answer as a rejection.
    pub async fn apply_occupant_request(
        &self,
        request: OccupantRequest,
    ) -> Result<Presence, MucError> {
        if request.room != self.address {
            return Err(MucError::NotAllowed);
        }
        let (presence, payloads, kicked, emptied, destroyed) = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::NotAllowed);
            }
            let Some(id) = state.roster.by_full(&request.user) else {
                return Err(MucError::NotAllowed);
            };
            match request.update {
                OccupantUpdate::SetRole { role, reason } => {
                    let mut payloads = Vec::new();
                    let mut kicked = Vec::new();
                    let presence = self.apply_role_locked(
                        &mut state,
                        id,
                        role,
                        reason.as_deref(),
                        &mut payloads,
                        &mut kicked,
                    )?;
                    let (emptied, destroyed) =
                        self.note_emptiness_locked(&mut state, &mut payloads);
                    (presence, payloads, kicked, emptied, destroyed)
                }
                OccupantUpdate::SetAffiliation { affiliation, role } => {
                    let Some(occ) = state.roster.get_mut(id) else {
                        return Err(MucError::NotAllowed);
                    };
                    occ.affiliation = affiliation;
                    occ.role = role;
                    let (user, nickname, base) =
                        (occ.user.clone(), occ.nickname.clone(), occ.presence.clone());
                    let Ok(from) = self.occupant_jid(&nickname) else {
                        return Err(MucError::NotAllowed);
                    };
                    self.fanout_presence(
                        &state,
                        Announcement {
                            occupant_jid: from.clone(),
                            real: &user,
                            affiliation,
                            role,
                            base: &base,
                            statuses: &[],
                            self_statuses: &[110],
                            new_nick: None,
                            reason: None,
                            room_wide: state.config.broadcasts_role(role),
                        },
                    );
                    let presence = build_presence(PresenceSpec {
                        base: &base,
                        from,
                        affiliation,
                        role,
                        real_jid: Some(&user),
                        new_nick: None,
                        reason: None,
                        statuses: &[],
                    });
                    (
                        presence,
                        vec![EventPayload::OccupantUpdated {
                            user,
                            role,
                            affiliation,
                        }],
                        Vec::new(),
                        false,
                        false,
                    )
                }
                OccupantUpdate::Deliver { stanza } => {
                    let Some(occ) = state.roster.get(id) else {
                        return Err(MucError::NotAllowed);
                    };
                    occ.send(stanza);
                    (occ.presence.clone(), Vec::new(), Vec::new(), false, false)
                }
            }
        };
        self.after_mutation(payloads, kicked, emptied, destroyed).await;
        Ok(presence)
    }
}

impl Room {
    /// Lock the room (owner only). A locked room admits only owners.
    pub async fn lock(&self, actor: &BareJid) -> Result<(), MucError> {
        self.set_locked(actor, true).await
    }

    /// Unlock the room (owner only) without touching its configuration.
    pub async fn unlock(&self, actor: &BareJid) -> Result<(), MucError> {
        self.set_locked(actor, false).await
    }

    async fn set_locked(&self, actor: &BareJid, locked: bool) -> Result<(), MucError> {
        let payloads = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            self.require_owner(&state, actor)?;
            state.locked_since = locked.then(Utc::now);
            if !locked {
                state.just_created = false;
            }
            state.modified_at = Utc::now();
            vec![EventPayload::ConfigChanged {
                config: state.config.clone(),
                locked,
            }]
        };
        self.publish(payloads).await;
        self.save().await;
        Ok(())
    }

    /// Apply a new configuration (owner only) and unlock the room.
    ///
    /// Turning `members_only` on evicts every occupant without at least
    /// member affiliation (status 321). Returns the presences broadcast
    /// for occupants the new configuration affected.
    pub async fn configure(
        &self,
        actor: &BareJid,
        config: RoomConfig,
    ) -> Result<Vec<Presence>, MucError> {
        let (updates, payloads, kicked, emptied, destroyed) = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            self.require_owner(&state, actor)?;
            let reconcile = (config.members_only && !state.config.members_only)
                || config.moderated != state.config.moderated;
            state.config = config;
            state.locked_since = None;
            state.just_created = false;
            state.modified_at = Utc::now();
            let mut payloads = vec![EventPayload::ConfigChanged {
                config: state.config.clone(),
                locked: false,
            }];
            let mut updates = Vec::new();
            let mut kicked = Vec::new();
            if reconcile {
                self.reconcile_occupants_locked(
                    &mut state,
                    None,
                    None,
                    &mut updates,
                    &mut kicked,
                    &mut payloads,
                );
            }
            // Only an eviction can change the emptiness of the room here.
            let (emptied, destroyed) = if kicked.is_empty() {
                (false, false)
            } else {
                self.note_emptiness_locked(&mut state, &mut payloads)
            };
            (updates, payloads, kicked, emptied, destroyed)
        };
        self.after_mutation(payloads, kicked, emptied, destroyed).await;
        self.save().await;
        Ok(updates)
    }

    /// Toggle members-only mode (owner only).
    pub async fn set_members_only(
        &self,
        actor: &BareJid,
        members_only: bool,
    ) -> Result<Vec<Presence>, MucError> {
        let config = {
            let state = self.state.read().await;
            RoomConfig {
                members_only,
                ..state.config.clone()
            }
        };
        self.configure(actor, config).await
    }

    /// Build a mediated invitation from `inviter` to `invitee`.
    ///
    /// Members-only rooms restrict inviting to admins and owners unless the
    /// room lets occupants invite. The service delegate may veto with
    /// `CannotBeInvited`. The caller routes the returned message to the
    /// invitee's server.
    pub async fn send_invitation(
        &self,
        inviter: &BareJid,
        invitee: &BareJid,
        reason: Option<&str>,
    ) -> Result<Message, MucError> {
        if !self.ctx.hooks.invitation_allowed(&self.address, invitee).await {
            return Err(MucError::CannotBeInvited);
        }
        let state = self.state.read().await;
        if state.destroyed {
            return Err(MucError::ServiceUnavailable);
        }
        let groups = self.ctx.groups.as_ref();
        if state.config.members_only && !state.config.occupants_can_invite {
            let privileged = self.ctx.config.is_sysadmin(inviter)
                || state.affiliations.is_owner(inviter, groups)
                || state.affiliations.is_admin(inviter, groups);
            if !privileged {
                return Err(MucError::Forbidden);
            }
        }
        Ok(invite_message(
            &self.address,
            invitee,
            Some(inviter),
            reason,
            state.config.password.as_deref(),
        ))
    }

    /// Build the rejection relayed back to an inviter whose invitation was
    /// declined. The caller routes the returned message.
    pub fn send_invitation_rejection(
        &self,
        decliner: &BareJid,
        inviter: &BareJid,
        reason: Option<&str>,
    ) -> Message {
        decline_message(&self.address, inviter, decliner, reason)
    }

    /// Destroy the room (owner only): evict every occupant with a destroy
    /// presence pointing at `alternate`, replicate, and delete the room
    /// from storage.
    #[instrument(skip_all, fields(room = %self.address))]
    pub async fn destroy(
        &self,
        actor: &BareJid,
        alternate: Option<&BareJid>,
        reason: Option<&str>,
    ) -> Result<(), MucError> {
        let (payloads, persistent) = {
            let mut state = self.state.write().await;
            if state.destroyed {
                return Err(MucError::ServiceUnavailable);
            }
            self.require_owner(&state, actor)?;
            self.evict_all_locked(&mut state, alternate, reason);
            state.destroyed = true;
            (
                vec![EventPayload::RoomDestroyed {
                    alternate: alternate.cloned(),
                    reason: reason.map(String::from),
                }],
                state.config.persistent,
            )
        };
        self.publish(payloads).await;
        if persistent {
            if let Err(error) = self.ctx.gateway.delete_room(&self.address).await {
                warn!(room = %self.address, %error, "failed to delete room from storage");
            }
        }
        self.ctx.hooks.room_destroyed(&self.address).await;
        info!("room destroyed");
        Ok(())
    }
}

impl Room {
    /// Apply an event replicated from another node.
    ///
    /// Followers mirror state and fan out to their own local sessions only:
    /// no persistence, no history logging, no lifecycle decisions, no hook
    /// notifications. Application is idempotent, since replication is
    /// at-least-once and an event may come around twice.
    pub async fn apply_replicated(&self, event: RoomEvent) {
        if event.room != self.address || event.origin == self.ctx.node {
            return;
        }
        let mut state = self.state.write().await;
        if state.destroyed {
            return;
        }
        match event.payload {
            EventPayload::OccupantJoined { occupant } => {
                if let Some(id) = state.roster.by_full(&occupant.user) {
                    // Re-delivered join: refresh the replica, announce nothing.
                    if let Some(existing) = state.roster.get_mut(id) {
                        existing.role = occupant.role;
                        existing.affiliation = occupant.affiliation;
                        existing.presence = occupant.presence;
                        return;
                    }
                }
                let Ok(from) = self.occupant_jid(&occupant.nickname) else {
                    return;
                };
                state.roster.insert(Occupant {
                    nickname: occupant.nickname.clone(),
                    user: occupant.user.clone(),
                    role: occupant.role,
                    affiliation: occupant.affiliation,
                    presence: occupant.presence.clone(),
                    location: Location::Remote {
                        node: occupant.node,
                    },
                    deaf: false,
                });
                state.empty_since = None;
                self.fanout_presence(
                    &state,
                    Announcement {
                        occupant_jid: from,
                        real: &occupant.user,
                        affiliation: occupant.affiliation,
                        role: occupant.role,
                        base: &occupant.presence,
                        statuses: &[],
                        self_statuses: &[110],
                        new_nick: None,
                        reason: None,
                        room_wide: state.config.broadcasts_role(occupant.role),
                    },
                );
            }
            EventPayload::OccupantLeft {
                user,
                nickname,
                statuses,
                reason,
            } => {
                let Some(id) = state.roster.by_full(&user) else {
                    return;
                };
                let last_session = state.roster.by_nickname(&nickname).len() == 1;
                let Some(occ) = state.roster.remove(id) else {
                    return;
                };
                let Ok(from) = self.occupant_jid(&occ.nickname) else {
                    return;
                };
                // A ban shows the target as outcast on the way out; every
                // other removal shows what the occupant last held.
                let affiliation = if statuses.contains(&301) {
                    Affiliation::Outcast
                } else if statuses.contains(&321) {
                    Affiliation::None
                } else {
                    occ.affiliation
                };
                let room_wide = !statuses.is_empty()
                    || (last_session
                        && state.config.roles_to_broadcast_presence.contains(&occ.role));
                if room_wide {
                    let base = Presence::new(PresenceType::Unavailable);
                    self.fanout_presence(
                        &state,
                        Announcement {
                            occupant_jid: from,
                            real: &occ.user,
                            affiliation,
                            role: Role::None,
                            base: &base,
                            statuses: &statuses,
                            self_statuses: &[110],
                            new_nick: None,
                            reason: reason.as_deref(),
                            room_wide: true,
                        },
                    );
                }
                if state.roster.is_empty() && state.config.persistent {
                    state.empty_since = Some(Utc::now());
                }
            }
            EventPayload::PresenceUpdated { user, presence } => {
                let Some(id) = state.roster.by_full(&user) else {
                    return;
                };
                let Some(occ) = state.roster.get_mut(id) else {
                    return;
                };
                occ.presence = presence.clone();
                let (nickname, affiliation, role) =
                    (occ.nickname.clone(), occ.affiliation, occ.role);
                let Ok(from) = self.occupant_jid(&nickname) else {
                    return;
                };
                self.fanout_presence(
                    &state,
                    Announcement {
                        occupant_jid: from,
                        real: &user,
                        affiliation,
                        role,
                        base: &presence,
                        statuses: &[],
                        self_statuses: &[110],
                        new_nick: None,
                        reason: None,
                        room_wide: state.config.roles_to_broadcast_presence.contains(&role),
                    },
                );
            }
            EventPayload::OccupantUpdated {
                user,
                role,
                affiliation,
            } => {
                let Some(id) = state.roster.by_full(&user) else {
                    return;
                };
                let Some(occ) = state.roster.get_mut(id) else {
                    return;
                };
                if occ.role == role && occ.affiliation == affiliation {
                    return;
                }
                occ.role = role;
                occ.affiliation = affiliation;
                let (nickname, base) = (occ.nickname.clone(), occ.presence.clone());
                let Ok(from) = self.occupant_jid(&nickname) else {
                    return;
                };
                self.fanout_presence(
                    &state,
                    Announcement {
                        occupant_jid: from,
                        real: &user,
                        affiliation,
                        role,
                        base: &base,
                        statuses: &[],
                        self_statuses: &[110],
                        new_nick: None,
                        reason: None,
                        room_wide: state.config.broadcasts_role(role),
                    },
                );
            }
            EventPayload::NicknameChanged {
                user,
                old_nickname: _,
                new_nickname,
                presence,
            } => {
                let Some(id) = state.roster.by_full(&user) else {
                    return;
                };
                let Some(occ) = state.roster.get(id) else {
                    return;
                };
                if occ.nickname.to_lowercase() == new_nickname.to_lowercase() {
                    return;
                }
                let (affiliation, role) = (occ.affiliation, occ.role);
                let Ok(old_jid) = self.occupant_jid(&occ.nickname) else {
                    return;
                };
                let Ok(new_jid) = self.occupant_jid(&new_nickname) else {
                    return;
                };
                let room_wide = state.config.roles_to_broadcast_presence.contains(&role);
                let unavailable = Presence::new(PresenceType::Unavailable);
                self.fanout_presence(
                    &state,
                    Announcement {
                        occupant_jid: old_jid,
                        real: &user,
                        affiliation,
                        role,
                        base: &unavailable,
                        statuses: &[303],
                        self_statuses: &[110],
                        new_nick: Some(&new_nickname),
                        reason: None,
                        room_wide,
                    },
                );
                state.roster.rename(id, &new_nickname);
                if let Some(occ) = state.roster.get_mut(id) {
                    occ.presence = presence.clone();
                }
                self.fanout_presence(
                    &state,
                    Announcement {
                        occupant_jid: new_jid,
                        real: &user,
                        affiliation,
                        role,
                        base: &presence,
                        statuses: &[],
                        self_statuses: &[110],
                        new_nick: None,
                        reason: None,
                        room_wide,
                    },
                );
            }
            EventPayload::AffiliationAdded { jid, affiliation } => {
                state.affiliations.apply(&jid, affiliation, None);
            }
            EventPayload::MemberAdded {
                jid,
                reserved_nickname,
            } => {
                state
                    .affiliations
                    .apply(&jid, Affiliation::Member, Some(&reserved_nickname));
            }
            EventPayload::MessageBroadcast { message } => {
                if let Some(id) = message.id.as_deref() {
                    if state.history.contains_id(id) {
                        return;
                    }
                    if state
                        .history
                        .changed_subject()
                        .and_then(|subject| subject.id.as_deref())
                        == Some(id)
                    {
                        return;
                    }
                }
                if let Some(subject) = message.subjects.values().next() {
                    if message.bodies.is_empty() {
                        state.subject = subject.0.clone();
                    }
                }
                state.history.add_message(message.clone(), Utc::now());
                self.deliver_message(&state, &message);
            }
            EventPayload::ConfigChanged { config, locked } => {
                state.config = config;
                state.locked_since = if locked {
                    state.locked_since.or_else(|| Some(Utc::now()))
                } else {
                    state.just_created = false;
                    None
                };
                state.modified_at = Utc::now();
            }
            EventPayload::RoomDestroyed { alternate, reason } => {
                self.evict_all_locked(&mut state, alternate.as_ref(), reason.as_deref());
                state.destroyed = true;
            }
        }
    }
}
