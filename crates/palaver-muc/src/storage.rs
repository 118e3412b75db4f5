//! The persistence gateway: the engine's contract with the database layer.
//!
//! Everything here is fire-and-forget from the engine's perspective except
//! the initial room load. Failures are logged and the in-memory state stays
//! authoritative; a mutation that never reached the database is lost only if
//! the process dies before the next successful save.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::BareJid;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::RoomConfig;
use crate::error::MucError;
use crate::types::Affiliation;

/// Everything needed to rebuild a room from the database.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RoomSnapshot {
    /// Room name (the node of its JID)
    pub name: String,
    /// Lazily assigned numeric id, present once the room was first saved
    pub room_id: Option<i64>,
    /// Full room configuration
    pub config: RoomConfig,
    /// Current subject
    pub subject: String,
    /// When the room was created
    pub created_at: DateTime<Utc>,
    /// When the configuration last changed
    pub modified_at: DateTime<Utc>,
    /// When the last occupant left, if the room is currently empty
    pub empty_since: Option<DateTime<Utc>>,
    /// Explicit owner entries
    pub owners: Vec<BareJid>,
    /// Explicit admin entries
    pub admins: Vec<BareJid>,
    /// Explicit member entries with their reserved nicknames (may be empty)
    pub members: Vec<(BareJid, String)>,
    /// Explicit outcast entries
    pub outcasts: Vec<BareJid>,
}

/// One logged broadcast message.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    /// The room the message was sent in
    pub room: BareJid,
    /// The sender's real bare JID
    pub sender: BareJid,
    /// The nickname the sender held
    pub nickname: String,
    /// When the message was broadcast
    pub stamp: DateTime<Utc>,
    /// Subject text, for subject changes
    pub subject: Option<String>,
    /// Body text
    pub body: Option<String>,
}

/// Load/save contract with the SQL layer.
///
/// Implementations own their connection pool; the engine never holds a room
/// lock across these calls.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Load a room by service and name. `None` means brand-new room.
    async fn load_room(&self, service: &str, name: &str) -> Result<Option<RoomSnapshot>, MucError>;

    /// Save (insert or update) a room's configuration and metadata.
    async fn save_room(&self, snapshot: &RoomSnapshot) -> Result<(), MucError>;

    /// Record an affiliation grant, replacing whatever `old` row existed.
    async fn save_affiliation(
        &self,
        room: &BareJid,
        jid: &BareJid,
        nickname: Option<&str>,
        new: Affiliation,
        old: Affiliation,
    ) -> Result<(), MucError>;

    /// Remove an affiliation row.
    async fn remove_affiliation(
        &self,
        room: &BareJid,
        jid: &BareJid,
        old: Affiliation,
    ) -> Result<(), MucError>;

    /// Delete a room and everything attached to it.
    async fn delete_room(&self, room: &BareJid) -> Result<(), MucError>;

    /// Append a batch of logged messages.
    async fn append_history(&self, rows: &[HistoryRow]) -> Result<(), MucError>;

    /// Load logged messages for a room, newest last.
    async fn load_history(
        &self,
        room: &BareJid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryRow>, MucError>;
}

/// Queue feeding the conversation log.
///
/// Broadcast messages are never written to the database inside the room's
/// critical section; the originating node enqueues a row here and a
/// periodic batch task flushes them. Cloning shares the queue.
#[derive(Debug, Clone)]
pub struct HistoryLogger {
    tx: mpsc::UnboundedSender<HistoryRow>,
}

impl HistoryLogger {
    /// Create a logger and spawn its flush task.
    pub fn spawn(gateway: Arc<dyn PersistenceGateway>, flush_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<HistoryRow>();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut batch = Vec::new();
                loop {
                    match rx.try_recv() {
                        Ok(row) => batch.push(row),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            flush(&*gateway, &batch).await;
                            return;
                        }
                    }
                }
                flush(&*gateway, &batch).await;
            }
        });
        Self { tx }
    }

    /// Create a logger whose rows land in the returned receiver instead of
    /// a database. Used by tests and embedders that log elsewhere.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HistoryRow>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue one row for the next flush.
    pub fn enqueue(&self, row: HistoryRow) {
        if self.tx.send(row).is_err() {
            warn!("history log queue is gone, dropping row");
        }
    }
}

async fn flush(gateway: &dyn PersistenceGateway, batch: &[HistoryRow]) {
    if batch.is_empty() {
        return;
    }
    debug!(rows = batch.len(), "flushing conversation log");
    if let Err(error) = gateway.append_history(batch).await {
        warn!(%error, rows = batch.len(), "failed to flush conversation log");
    }
}

/// In-memory gateway for tests and standalone deployments.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    rooms: Mutex<HashMap<String, RoomSnapshot>>,
    history: Mutex<HashMap<BareJid, Vec<HistoryRow>>>,
}

impl MemoryGateway {
    /// Create an empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of logged rows for a room.
    pub async fn history_len(&self, room: &BareJid) -> usize {
        self.history
            .lock()
            .await
            .get(room)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn load_room(&self, _service: &str, name: &str) -> Result<Option<RoomSnapshot>, MucError> {
        Ok(self.rooms.lock().await.get(name).cloned())
    }

    async fn save_room(&self, snapshot: &RoomSnapshot) -> Result<(), MucError> {
        self.rooms
            .lock()
            .await
            .insert(snapshot.name.clone(), snapshot.clone());
        Ok(())
    }

    async fn save_affiliation(
        &self,
        room: &BareJid,
        jid: &BareJid,
        nickname: Option<&str>,
        new: Affiliation,
        _old: Affiliation,
    ) -> Result<(), MucError> {
        let mut rooms = self.rooms.lock().await;
        let Some(snapshot) = rooms.get_mut(room.node().map(|n| n.as_str()).unwrap_or_default())
        else {
            return Ok(());
        };
        snapshot.owners.retain(|j| j != jid);
        snapshot.admins.retain(|j| j != jid);
        snapshot.members.retain(|(j, _)| j != jid);
        snapshot.outcasts.retain(|j| j != jid);
        match new {
            Affiliation::Owner => snapshot.owners.push(jid.clone()),
            Affiliation::Admin => snapshot.admins.push(jid.clone()),
            Affiliation::Member => snapshot
                .members
                .push((jid.clone(), nickname.unwrap_or_default().to_string())),
            Affiliation::Outcast => snapshot.outcasts.push(jid.clone()),
            Affiliation::None => {}
        }
        Ok(())
    }

    async fn remove_affiliation(
        &self,
        room: &BareJid,
        jid: &BareJid,
        old: Affiliation,
    ) -> Result<(), MucError> {
        self.save_affiliation(room, jid, None, Affiliation::None, old)
            .await
    }

    async fn delete_room(&self, room: &BareJid) -> Result<(), MucError> {
        let name = room.node().map(|n| n.as_str()).unwrap_or_default();
        self.rooms.lock().await.remove(name);
        self.history.lock().await.remove(room);
        Ok(())
    }

    async fn append_history(&self, rows: &[HistoryRow]) -> Result<(), MucError> {
        let mut history = self.history.lock().await;
        for row in rows {
            history.entry(row.room.clone()).or_default().push(row.clone());
        }
        Ok(())
    }

    async fn load_history(
        &self,
        room: &BareJid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryRow>, MucError> {
        let history = self.history.lock().await;
        let rows = history.get(room).cloned().unwrap_or_default();
        Ok(match since {
            Some(since) => rows.into_iter().filter(|row| row.stamp >= since).collect(),
            None => rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn room_jid() -> BareJid {
        "lobby@conference.example.com".parse().unwrap()
    }

    fn snapshot(name: &str) -> RoomSnapshot {
        RoomSnapshot {
            name: name.to_string(),
            room_id: None,
            config: RoomConfig {
                name: name.to_string(),
                ..Default::default()
            },
            subject: String::new(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
            empty_since: None,
            owners: vec!["alice@example.com".parse().unwrap()],
            admins: vec![],
            members: vec![],
            outcasts: vec![],
        }
    }

    fn row(body: &str) -> HistoryRow {
        HistoryRow {
            room: room_jid(),
            sender: "alice@example.com".parse().unwrap(),
            nickname: "alice".into(),
            stamp: Utc::now(),
            subject: None,
            body: Some(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_room_config_round_trips() {
        let gateway = MemoryGateway::new();
        let mut snapshot = snapshot("lobby");
        snapshot.config.password = Some("hunter2".into());
        snapshot.config.max_occupants = 7;
        snapshot.config.members_only = true;
        snapshot.config.roles_to_broadcast_presence = vec![Role::Moderator];
        gateway.save_room(&snapshot).await.unwrap();

        let loaded = gateway
            .load_room("conference.example.com", "lobby")
            .await
            .unwrap()
            .expect("room saved");
        assert_eq!(loaded.config.password.as_deref(), Some("hunter2"));
        assert_eq!(loaded.config.max_occupants, 7);
        assert!(loaded.config.members_only);
        assert_eq!(
            loaded.config.roles_to_broadcast_presence,
            vec![Role::Moderator]
        );
        assert_eq!(loaded.owners.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_room_loads_as_none() {
        let gateway = MemoryGateway::new();
        let loaded = gateway
            .load_room("conference.example.com", "nowhere")
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_affiliation_rows_move_between_lists() {
        let gateway = MemoryGateway::new();
        gateway.save_room(&snapshot("lobby")).await.unwrap();
        let bob: BareJid = "bob@example.com".parse().unwrap();

        gateway
            .save_affiliation(&room_jid(), &bob, Some("bobby"), Affiliation::Member, Affiliation::None)
            .await
            .unwrap();
        gateway
            .save_affiliation(&room_jid(), &bob, None, Affiliation::Outcast, Affiliation::Member)
            .await
            .unwrap();

        let loaded = gateway
            .load_room("conference.example.com", "lobby")
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.members.is_empty());
        assert_eq!(loaded.outcasts, vec![bob]);
    }

    #[tokio::test]
    async fn test_logger_flushes_batches() {
        let gateway = Arc::new(MemoryGateway::new());
        let logger = HistoryLogger::spawn(gateway.clone(), Duration::from_millis(10));
        logger.enqueue(row("one"));
        logger.enqueue(row("two"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.history_len(&room_jid()).await, 2);
    }

    #[tokio::test]
    async fn test_history_since_filter() {
        let gateway = MemoryGateway::new();
        let mut old = row("old");
        old.stamp = Utc::now() - chrono::Duration::hours(2);
        gateway.append_history(&[old, row("new")]).await.unwrap();

        let rows = gateway
            .load_history(&room_jid(), Some(Utc::now() - chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body.as_deref(), Some("new"));
    }
}
