//! Two-node replication: followers mirror state, the originator alone keeps
//! the durable side effects, and remote-occupant mutations round-trip
//! synchronously.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jid::{BareJid, FullJid, Jid};
use tokio::sync::mpsc;
use xmpp_parsers::message::{Body, Message};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use palaver_muc::presence::status_codes;
use palaver_muc::{
    Affiliation, ClusterBus, EventPayload, HistoryLogger, HistoryRow, LocalCluster,
    MemoryGateway, MucError, NoGroups, NoHooks, NodeId, OccupantData, OccupantRequest,
    OccupantSnapshot, OccupantUpdate, Role, Room, RoomConfig, RoomEvent, RoomSnapshot,
    ServiceConfig, ServiceContext, Stanza,
};

fn bare(s: &str) -> BareJid {
    s.parse().unwrap()
}

fn full(s: &str) -> FullJid {
    s.parse().unwrap()
}

fn node_ctx(
    cluster: &Arc<LocalCluster>,
) -> (ServiceContext, mpsc::UnboundedReceiver<HistoryRow>) {
    let node = NodeId::new();
    let (log, rows) = HistoryLogger::channel();
    let ctx = ServiceContext {
        node,
        config: ServiceConfig::new("conference.example.com"),
        bus: cluster.bus(node),
        gateway: Arc::new(MemoryGateway::new()),
        groups: Arc::new(NoGroups),
        hooks: Arc::new(NoHooks),
        log,
    };
    (ctx, rows)
}

fn snapshot(name: &str, owner: &str, logging_enabled: bool) -> RoomSnapshot {
    RoomSnapshot {
        name: name.to_string(),
        room_id: Some(1),
        config: RoomConfig {
            name: name.to_string(),
            persistent: true,
            logging_enabled,
            ..Default::default()
        },
        subject: String::new(),
        created_at: Utc::now(),
        modified_at: Utc::now(),
        empty_since: None,
        owners: vec![owner.parse().unwrap()],
        admins: vec![],
        members: vec![],
        outcasts: vec![],
    }
}

/// The same room replicated on two in-process nodes.
fn replicated_pair(
    logging_enabled: bool,
) -> (
    Arc<Room>,
    Arc<Room>,
    mpsc::UnboundedReceiver<HistoryRow>,
    mpsc::UnboundedReceiver<HistoryRow>,
) {
    let cluster = LocalCluster::new();
    let (ctx1, rows1) = node_ctx(&cluster);
    let (ctx2, rows2) = node_ctx(&cluster);
    let node1 = ctx1.node;
    let node2 = ctx2.node;
    let room1 = Room::load(
        ctx1,
        snapshot("lobby", "alice@example.com", logging_enabled),
        Vec::new(),
    )
    .unwrap();
    let room2 = Room::load(
        ctx2,
        snapshot("lobby", "alice@example.com", logging_enabled),
        Vec::new(),
    )
    .unwrap();
    cluster.register(node1, &room1);
    cluster.register(node2, &room2);
    (room1, room2, rows1, rows2)
}

async fn join(
    room: &Room,
    nickname: &str,
    jid: &str,
) -> (OccupantSnapshot, mpsc::UnboundedReceiver<Stanza>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let snapshot = room
        .join(
            nickname,
            None,
            None,
            &full(jid),
            Presence::new(PresenceType::None),
            tx,
        )
        .await
        .unwrap();
    (snapshot, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Stanza>) -> Vec<Stanza> {
    let mut stanzas = Vec::new();
    while let Ok(stanza) = rx.try_recv() {
        stanzas.push(stanza);
    }
    stanzas
}

fn chat(id: &str, body: &str) -> Message {
    let mut message = Message::new(None::<Jid>);
    message.id = Some(id.to_string());
    message.bodies.insert(String::new(), Body(body.to_string()));
    message
}

#[tokio::test]
async fn test_join_replicates_to_follower() {
    let (room1, room2, _rows1, _rows2) = replicated_pair(false);
    let (alice, _alice_rx) = join(&room1, "alice", "alice@example.com/desktop").await;
    assert_eq!(alice.node, None);

    assert_eq!(room2.occupant_count().await, 1);
    let replica = &room2.occupants_by_nickname("alice").await[0];
    assert_eq!(replica.node, Some(room1.node()));
    assert_eq!(replica.affiliation, Affiliation::Owner);
    assert_eq!(replica.role, Role::Moderator);
}

#[tokio::test]
async fn test_broadcast_reaches_other_node_sessions() {
    let (room1, room2, _rows1, _rows2) = replicated_pair(false);
    let (_, _alice_rx) = join(&room1, "alice", "alice@example.com/desktop").await;
    let (_, mut bob_rx) = join(&room2, "bob", "bob@example.com/desktop").await;
    drain(&mut bob_rx);

    room1
        .broadcast_message(&full("alice@example.com/desktop"), chat("m1", "hello"))
        .await
        .unwrap();

    let received: Vec<Message> = drain(&mut bob_rx)
        .iter()
        .filter_map(|s| s.as_message().cloned())
        .collect();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].bodies.values().next().map(|b| b.0.as_str()),
        Some("hello")
    );
    assert_eq!(
        received[0].from,
        Some("lobby@conference.example.com/alice".parse::<Jid>().unwrap())
    );
}

#[tokio::test]
async fn test_only_originator_logs_history() {
    let (room1, _room2, mut rows1, mut rows2) = replicated_pair(true);
    let (_, _alice_rx) = join(&room1, "alice", "alice@example.com/desktop").await;

    room1
        .broadcast_message(&full("alice@example.com/desktop"), chat("m1", "logged"))
        .await
        .unwrap();

    let row = rows1.try_recv().expect("originator queued the row");
    assert_eq!(row.body.as_deref(), Some("logged"));
    assert!(rows1.try_recv().is_err());
    assert!(rows2.try_recv().is_err());
}

#[tokio::test]
async fn test_follower_application_is_idempotent() {
    let (room1, room2, _rows1, _rows2) = replicated_pair(false);
    let (_, mut bob_rx) = join(&room2, "bob", "bob@example.com/desktop").await;
    drain(&mut bob_rx);

    let origin = room1.node();
    let join_event = RoomEvent {
        room: room2.address().clone(),
        origin,
        payload: EventPayload::OccupantJoined {
            occupant: OccupantData {
                nickname: "carol".into(),
                user: full("carol@example.com/desktop"),
                role: Role::Participant,
                affiliation: Affiliation::None,
                presence: Presence::new(PresenceType::None),
                node: origin,
            },
        },
    };
    room2.apply_replicated(join_event.clone()).await;
    room2.apply_replicated(join_event).await;
    assert_eq!(room2.occupants_by_nickname("carol").await.len(), 1);

    let message_event = RoomEvent {
        room: room2.address().clone(),
        origin,
        payload: EventPayload::MessageBroadcast {
            message: chat("dup", "once"),
        },
    };
    room2.apply_replicated(message_event.clone()).await;
    room2.apply_replicated(message_event).await;
    let received: Vec<Message> = drain(&mut bob_rx)
        .iter()
        .filter_map(|s| s.as_message().cloned())
        .filter(|m| m.id.as_deref() == Some("dup"))
        .collect();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn test_remote_kick_round_trips() {
    let (room1, room2, _rows1, _rows2) = replicated_pair(false);
    let (_, _alice_rx) = join(&room1, "alice", "alice@example.com/desktop").await;
    let (_, mut bob_rx) = join(&room2, "bob", "bob@example.com/desktop").await;
    drain(&mut bob_rx);

    // Bob's session is hosted on node 2; alice kicks from node 1.
    let presence = room1
        .change_role(
            &full("alice@example.com/desktop"),
            &full("bob@example.com/desktop"),
            Role::None,
            Some("enough"),
        )
        .await
        .unwrap();
    assert!(status_codes(&presence).contains(&307));
    assert_eq!(room1.occupants_by_nickname("bob").await.len(), 0);
    assert_eq!(room2.occupants_by_nickname("bob").await.len(), 0);
    let stanzas = drain(&mut bob_rx);
    assert!(stanzas
        .iter()
        .filter_map(Stanza::as_presence)
        .any(|p| status_codes(p).contains(&307)));
}

#[tokio::test]
async fn test_presence_update_replicates() {
    let (room1, room2, _rows1, _rows2) = replicated_pair(false);
    let (_, _alice_rx) = join(&room1, "alice", "alice@example.com/desktop").await;
    let (_, mut bob_rx) = join(&room2, "bob", "bob@example.com/desktop").await;
    drain(&mut bob_rx);

    room1
        .presence_updated(
            &full("alice@example.com/desktop"),
            Presence::new(PresenceType::None),
        )
        .await
        .unwrap();

    // Bob's session on node 2 sees the update under alice's occupant address.
    let alice_jid: Jid = "lobby@conference.example.com/alice".parse().unwrap();
    assert!(drain(&mut bob_rx)
        .iter()
        .filter_map(Stanza::as_presence)
        .any(|p| p.from.as_ref() == Some(&alice_jid)));
}

#[tokio::test]
async fn test_occupant_request_applies_affiliation() {
    let (room1, room2, _rows1, _rows2) = replicated_pair(false);
    let (_, _alice_rx) = join(&room1, "alice", "alice@example.com/desktop").await;
    let (_, _bob_rx) = join(&room2, "bob", "bob@example.com/desktop").await;

    // A request addressed to the wrong room is a rejection.
    let rejected = room2
        .apply_occupant_request(OccupantRequest {
            room: bare("elsewhere@conference.example.com"),
            user: full("bob@example.com/desktop"),
            update: OccupantUpdate::SetAffiliation {
                affiliation: Affiliation::Member,
                role: Role::Participant,
            },
        })
        .await;
    assert!(matches!(rejected, Err(MucError::NotAllowed)));

    let presence = room2
        .apply_occupant_request(OccupantRequest {
            room: room2.address().clone(),
            user: full("bob@example.com/desktop"),
            update: OccupantUpdate::SetAffiliation {
                affiliation: Affiliation::Member,
                role: Role::Participant,
            },
        })
        .await
        .unwrap();
    assert_eq!(
        presence.from,
        Some("lobby@conference.example.com/bob".parse::<Jid>().unwrap())
    );
    let bob = &room2.occupants_by_nickname("bob").await[0];
    assert_eq!(bob.affiliation, Affiliation::Member);
    // The hosting node replicates the accepted change back out.
    let replica = &room1.occupants_by_nickname("bob").await[0];
    assert_eq!(replica.affiliation, Affiliation::Member);
}

#[tokio::test]
async fn test_affiliation_change_replicates() {
    let (room1, room2, _rows1, _rows2) = replicated_pair(false);
    let (_, _alice_rx) = join(&room1, "alice", "alice@example.com/desktop").await;
    let (_, _bob_rx) = join(&room2, "bob", "bob@example.com/desktop").await;

    room1
        .change_affiliation(
            &bare("alice@example.com"),
            &bare("bob@example.com"),
            Affiliation::Admin,
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        room2.affiliation_of(&bare("bob@example.com")).await,
        Affiliation::Admin
    );
    let replica = &room2.occupants_by_nickname("bob").await[0];
    assert_eq!(replica.affiliation, Affiliation::Admin);
    assert_eq!(replica.role, Role::Moderator);
}

#[tokio::test]
async fn test_private_message_crosses_nodes() {
    let (room1, room2, _rows1, _rows2) = replicated_pair(false);
    let (_, _alice_rx) = join(&room1, "alice", "alice@example.com/desktop").await;
    let (_, mut bob_rx) = join(&room2, "bob", "bob@example.com/desktop").await;
    drain(&mut bob_rx);

    room1
        .send_private_message(
            &full("alice@example.com/desktop"),
            "bob",
            chat("pm1", "psst"),
        )
        .await
        .unwrap();

    let received: Vec<Message> = drain(&mut bob_rx)
        .iter()
        .filter_map(|s| s.as_message().cloned())
        .collect();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].bodies.values().next().map(|b| b.0.as_str()),
        Some("psst")
    );
}

#[tokio::test]
async fn test_destroy_evicts_on_every_node() {
    let (room1, room2, _rows1, _rows2) = replicated_pair(false);
    let (_, _alice_rx) = join(&room1, "alice", "alice@example.com/desktop").await;
    let (_, mut bob_rx) = join(&room2, "bob", "bob@example.com/desktop").await;
    drain(&mut bob_rx);

    room1
        .destroy(&bare("alice@example.com"), None, Some("closing"))
        .await
        .unwrap();
    assert!(room1.is_destroyed().await);
    assert!(room2.is_destroyed().await);
    assert_eq!(room2.occupant_count().await, 0);
    assert!(drain(&mut bob_rx)
        .iter()
        .filter_map(Stanza::as_presence)
        .any(|p| p.type_ == PresenceType::Unavailable));
}

/// A bus whose peers never answer synchronous requests.
struct UnresponsiveBus;

#[async_trait]
impl ClusterBus for UnresponsiveBus {
    async fn publish(&self, _event: RoomEvent) {}

    async fn update_occupant(
        &self,
        _node: NodeId,
        _request: OccupantRequest,
    ) -> Option<xmpp_parsers::presence::Presence> {
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_remote_role_change_times_out_closed() {
    let (log, _) = HistoryLogger::channel();
    let mut service = ServiceConfig::new("conference.example.com");
    service.remote_call_timeout = Duration::from_millis(50);
    let ctx = ServiceContext {
        node: NodeId::new(),
        config: service,
        bus: Arc::new(UnresponsiveBus),
        gateway: Arc::new(MemoryGateway::new()),
        groups: Arc::new(NoGroups),
        hooks: Arc::new(NoHooks),
        log,
    };
    let room = Room::load(ctx, snapshot("lobby", "alice@example.com", false), Vec::new()).unwrap();
    let (_, _alice_rx) = join(&room, "alice", "alice@example.com/desktop").await;

    // A replica of a session hosted elsewhere.
    let remote_node = NodeId::new();
    room.apply_replicated(RoomEvent {
        room: room.address().clone(),
        origin: remote_node,
        payload: EventPayload::OccupantJoined {
            occupant: OccupantData {
                nickname: "bob".into(),
                user: full("bob@example.com/desktop"),
                role: Role::Participant,
                affiliation: Affiliation::None,
                presence: Presence::new(PresenceType::None),
                node: remote_node,
            },
        },
    })
    .await;

    let result = room
        .change_role(
            &full("alice@example.com/desktop"),
            &full("bob@example.com/desktop"),
            Role::None,
            None,
        )
        .await;
    assert!(matches!(result, Err(MucError::NotAllowed)));
    // Fail closed: the local replica was not mutated.
    assert_eq!(room.occupants_by_nickname("bob").await.len(), 1);
}
