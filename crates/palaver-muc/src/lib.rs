//! # palaver-muc
//!
//! Clustered Multi-User Chat room engine for the Palaver groupchat service.
//!
//! This crate is the room core of an XEP-0045 service: it owns live
//! membership, the affiliation/role permission model, message and presence
//! fan-out, bounded room history, and the replication of room state across
//! a cluster of server nodes. The surrounding service (stanza routing,
//! service discovery, the owner/admin configuration forms, and the SQL
//! layer) talks to it through the traits in [`storage`], [`cluster`],
//! [`group`], and [`hooks`].
//!
//! ## Architecture
//!
//! - **[`room::Room`]**: one room behind one `RwLock`; every mutating
//!   operation applies fully or rejects with a typed [`MucError`]
//! - **[`roster::OccupantRoster`]**: one occupant store, three derived
//!   indices (nickname, bare JID, full JID), updated through one API
//! - **[`privileges`]**: pure derivation of role and affiliation, including
//!   group-expanded affiliation entries
//! - **[`event`] / [`cluster`]**: every mutation doubles as a serializable
//!   event; the originating node keeps the durable side effects, follower
//!   nodes mirror state idempotently
//! - **[`history`]**: count- and age-bounded replay for late joiners
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use palaver_muc::{MemoryGateway, Room, ServiceConfig, ServiceContext};
//!
//! # async fn example() -> Result<(), palaver_muc::MucError> {
//! let ctx = ServiceContext::standalone(
//!     ServiceConfig::new("conference.example.org"),
//!     Arc::new(MemoryGateway::new()),
//! );
//! let creator = "alice@example.org".parse().unwrap();
//! let room = Room::create(ctx, "lobby", &creator)?;
//! # Ok(())
//! # }
//! ```

pub mod affiliations;
pub mod cluster;
pub mod config;
pub mod error;
pub mod event;
pub mod group;
pub mod history;
pub mod hooks;
pub mod occupant;
pub mod presence;
pub mod privileges;
pub mod room;
pub mod roster;
pub mod storage;
pub mod types;

pub use cluster::{ClusterBus, LocalCluster, LocalClusterBus, NullClusterBus};
pub use config::{RoomConfig, ServiceConfig};
pub use error::MucError;
pub use event::{EventPayload, OccupantData, OccupantRequest, OccupantUpdate, RoomEvent};
pub use group::{GroupResolver, NoGroups, StaticGroups};
pub use history::{HistoryRequest, HistoryStrategy};
pub use hooks::{EngineHooks, NoHooks};
pub use occupant::{Location, Occupant, OccupantSnapshot};
pub use room::{Room, ServiceContext};
pub use storage::{HistoryLogger, HistoryRow, MemoryGateway, PersistenceGateway, RoomSnapshot};
pub use types::{Affiliation, NodeId, PrivateMessagePolicy, Role, Stanza, StanzaSink};
