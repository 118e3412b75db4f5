//! Cluster fan-out of room events.
//!
//! The [`ClusterBus`] is the engine's only view of the other nodes: a
//! fire-and-forget `publish` for replication events and a synchronous
//! `update_occupant` for mutations that must land on a specific occupant's
//! hosting node. The bus is handed in at room construction, so a standalone
//! deployment runs the exact same engine over a [`NullClusterBus`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;
use tracing::{debug, warn};
use xmpp_parsers::presence::Presence;

use crate::error::MucError;
use crate::event::{OccupantRequest, RoomEvent};
use crate::room::Room;
use crate::types::NodeId;

/// Transport between the nodes hosting replicas of a room.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Deliver an event to every other node hosting the room.
    ///
    /// At-least-once, fire-and-forget; receivers apply it as followers.
    async fn publish(&self, event: RoomEvent);

    /// Ask one specific node to apply a mutation to an occupant it hosts
    /// and answer with the occupant's updated presence. `None` is a
    /// rejection ("room not found" and undecodable replies included),
    /// never a success.
    async fn update_occupant(&self, node: NodeId, request: OccupantRequest) -> Option<Presence>;
}

/// Bus for rooms with no replicas anywhere else.
#[derive(Debug, Default)]
pub struct NullClusterBus;

#[async_trait]
impl ClusterBus for NullClusterBus {
    async fn publish(&self, _event: RoomEvent) {}

    async fn update_occupant(&self, node: NodeId, _request: OccupantRequest) -> Option<Presence> {
        warn!(%node, "occupant update addressed to a node, but clustering is disabled");
        None
    }
}

/// Issue the synchronous cross-node round-trip for a remote occupant.
///
/// Runs strictly outside any room lock. The deadline fails the operation
/// closed: a node that does not answer in time is treated exactly like a
/// node that answered with a rejection.
pub async fn update_remote_occupant(
    bus: &dyn ClusterBus,
    deadline: Duration,
    node: NodeId,
    request: OccupantRequest,
) -> Result<Presence, MucError> {
    match tokio::time::timeout(deadline, bus.update_occupant(node, request)).await {
        Ok(Some(presence)) => Ok(presence),
        Ok(None) => Err(MucError::NotAllowed),
        Err(_) => {
            warn!(%node, ?deadline, "remote occupant update timed out");
            Err(MucError::NotAllowed)
        }
    }
}

/// In-process cluster fabric: every "node" lives in this process.
///
/// Backs multi-node tests and single-process multi-replica deployments.
/// Rooms are held weakly; a dropped room simply stops receiving events.
#[derive(Debug, Default)]
pub struct LocalCluster {
    nodes: DashMap<NodeId, DashMap<BareJid, Weak<Room>>>,
}

impl LocalCluster {
    /// Create an empty fabric.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The bus a node uses to talk to the rest of the fabric.
    pub fn bus(self: &Arc<Self>, node: NodeId) -> Arc<LocalClusterBus> {
        self.nodes.entry(node).or_default();
        Arc::new(LocalClusterBus {
            cluster: Arc::clone(self),
            node,
        })
    }

    /// Register a node's replica of a room.
    pub fn register(&self, node: NodeId, room: &Arc<Room>) {
        self.nodes
            .entry(node)
            .or_default()
            .insert(room.address().clone(), Arc::downgrade(room));
    }

    fn room_on(&self, node: NodeId, address: &BareJid) -> Option<Arc<Room>> {
        self.nodes
            .get(&node)?
            .get(address)
            .and_then(|weak| weak.upgrade())
    }
}

/// One node's handle onto a [`LocalCluster`].
pub struct LocalClusterBus {
    cluster: Arc<LocalCluster>,
    node: NodeId,
}

#[async_trait]
impl ClusterBus for LocalClusterBus {
    async fn publish(&self, event: RoomEvent) {
        let peers: Vec<Arc<Room>> = self
            .cluster
            .nodes
            .iter()
            .filter(|entry| *entry.key() != self.node)
            .filter_map(|entry| entry.value().get(&event.room).and_then(|weak| weak.upgrade()))
            .collect();
        debug!(room = %event.room, peers = peers.len(), "publishing room event");
        for room in peers {
            room.apply_replicated(event.clone()).await;
        }
    }

    async fn update_occupant(&self, node: NodeId, request: OccupantRequest) -> Option<Presence> {
        let room = self.cluster.room_on(node, &request.room)?;
        match room.apply_occupant_request(request).await {
            Ok(presence) => Some(presence),
            Err(error) => {
                debug!(%node, %error, "occupant update rejected by hosting node");
                None
            }
        }
    }
}

impl std::fmt::Debug for LocalClusterBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalClusterBus")
            .field("node", &self.node)
            .finish()
    }
}
