//! Room history: a bounded rolling buffer of recent broadcast messages.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jid::Jid;
use xmpp_parsers::delay::Delay;
use xmpp_parsers::message::Message;

/// Retention bounds for a room's history buffer.
#[derive(Debug, Clone)]
pub struct HistoryStrategy {
    /// Maximum messages kept (and replayed to joiners)
    pub max_messages: usize,
    /// Messages older than this are dropped on append
    pub max_age: Option<Duration>,
}

impl Default for HistoryStrategy {
    fn default() -> Self {
        Self {
            max_messages: 25,
            max_age: None,
        }
    }
}

/// A joiner's request to bound the history replayed to them (XEP-0045 §7.2.14).
#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    /// At most this many stanzas
    pub max_stanzas: Option<usize>,
    /// At most this many characters of message bodies
    pub max_chars: Option<usize>,
    /// Only messages from the last N seconds
    pub seconds: Option<u64>,
    /// Only messages after this instant
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    message: Message,
    stamp: DateTime<Utc>,
}

/// Rolling buffer of recent messages plus the last subject change.
#[derive(Debug, Default)]
pub struct RoomHistory {
    strategy: HistoryStrategy,
    entries: VecDeque<HistoryEntry>,
    changed_subject: Option<Message>,
}

impl RoomHistory {
    /// Create an empty history with the given retention bounds.
    pub fn new(strategy: HistoryStrategy) -> Self {
        Self {
            strategy,
            entries: VecDeque::new(),
            changed_subject: None,
        }
    }

    /// Append a broadcast message, evicting entries past the bounds.
    ///
    /// Subject-only messages are tracked separately and replayed after the
    /// history so late joiners always learn the current subject.
    pub fn add_message(&mut self, message: Message, stamp: DateTime<Utc>) {
        if is_subject_change(&message) {
            self.changed_subject = Some(message);
            return;
        }
        self.entries.push_back(HistoryEntry { message, stamp });
        while self.entries.len() > self.strategy.max_messages {
            self.entries.pop_front();
        }
        if let Some(max_age) = self.strategy.max_age {
            let now = Utc::now();
            while let Some(front) = self.entries.front() {
                let age = (now - front.stamp).to_std().unwrap_or(Duration::ZERO);
                if age > max_age {
                    self.entries.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Seed the buffer from persisted rows, oldest first.
    pub fn seed(&mut self, rows: impl IntoIterator<Item = (Message, DateTime<Utc>)>) {
        for (message, stamp) in rows {
            self.add_message(message, stamp);
        }
    }

    /// Whether a message with the given id is already buffered.
    ///
    /// Replication is at-least-once; followers use this to keep a
    /// re-delivered broadcast from appending twice.
    pub fn contains_id(&self, id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.message.id.as_deref() == Some(id))
    }

    /// The most recent subject-bearing message, if any.
    pub fn changed_subject(&self) -> Option<&Message> {
        self.changed_subject.as_ref()
    }

    /// Record a subject change directly (used when seeding from storage).
    pub fn set_changed_subject(&mut self, message: Message) {
        self.changed_subject = Some(message);
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The messages to replay to a joiner, oldest first, each stamped with
    /// an XEP-0203 delay carrying the room's address and the original time.
    pub fn replay(&self, room: &Jid, request: Option<&HistoryRequest>) -> Vec<Message> {
        let mut selected: Vec<&HistoryEntry> = self.entries.iter().collect();
        if let Some(request) = request {
            if let Some(since) = request.since {
                selected.retain(|entry| entry.stamp >= since);
            }
            if let Some(seconds) = request.seconds {
                let cutoff = Utc::now() - chrono::Duration::seconds(seconds as i64);
                selected.retain(|entry| entry.stamp >= cutoff);
            }
            if let Some(max_stanzas) = request.max_stanzas {
                let skip = selected.len().saturating_sub(max_stanzas);
                selected.drain(..skip);
            }
            if let Some(max_chars) = request.max_chars {
                // Keep the newest messages whose combined body length fits.
                let mut total = 0usize;
                let mut keep = 0usize;
                for entry in selected.iter().rev() {
                    total += body_len(&entry.message);
                    if total > max_chars {
                        break;
                    }
                    keep += 1;
                }
                let skip = selected.len() - keep;
                selected.drain(..skip);
            }
        }
        selected
            .into_iter()
            .map(|entry| {
                let mut message = entry.message.clone();
                message.payloads.push(
                    Delay {
                        from: Some(room.clone()),
                        stamp: xmpp_parsers::date::DateTime(entry.stamp.fixed_offset()),
                        data: None,
                    }
                    .into(),
                );
                message
            })
            .collect()
    }
}

fn body_len(message: &Message) -> usize {
    message.bodies.values().map(|body| body.0.len()).sum()
}

fn is_subject_change(message: &Message) -> bool {
    !message.subjects.is_empty() && message.bodies.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jid::BareJid;
    use xmpp_parsers::message::{Body, Message, MessageType, Subject};

    fn room_jid() -> Jid {
        Jid::from("lobby@conference.example.com".parse::<BareJid>().unwrap())
    }

    fn chat(id: &str, body: &str) -> Message {
        let mut msg = Message::new(None::<Jid>);
        msg.type_ = MessageType::Groupchat;
        msg.id = Some(id.to_string());
        msg.bodies.insert(String::new(), Body(body.to_string()));
        msg
    }

    fn subject(text: &str) -> Message {
        let mut msg = Message::new(None::<Jid>);
        msg.type_ = MessageType::Groupchat;
        msg.subjects.insert(String::new(), Subject(text.to_string()));
        msg
    }

    #[test]
    fn test_count_bound_evicts_oldest() {
        let mut history = RoomHistory::new(HistoryStrategy {
            max_messages: 2,
            max_age: None,
        });
        for i in 0..4 {
            history.add_message(chat(&format!("m{i}"), "hi"), Utc::now());
        }
        assert_eq!(history.len(), 2);
        assert!(!history.contains_id("m1"));
        assert!(history.contains_id("m3"));
    }

    #[test]
    fn test_age_bound_evicts_stale_entries() {
        let mut history = RoomHistory::new(HistoryStrategy {
            max_messages: 25,
            max_age: Some(Duration::from_secs(60)),
        });
        history.add_message(chat("old", "hi"), Utc::now() - chrono::Duration::hours(1));
        history.add_message(chat("new", "hi"), Utc::now());
        assert!(!history.contains_id("old"));
        assert!(history.contains_id("new"));
    }

    #[test]
    fn test_subject_survives_rotation() {
        let mut history = RoomHistory::new(HistoryStrategy {
            max_messages: 1,
            max_age: None,
        });
        history.add_message(subject("welcome"), Utc::now());
        history.add_message(chat("m1", "hi"), Utc::now());
        history.add_message(chat("m2", "hi"), Utc::now());
        let subject_msg = history.changed_subject().expect("subject kept");
        assert_eq!(
            subject_msg.subjects.values().next().map(|s| s.0.as_str()),
            Some("welcome")
        );
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_replay_respects_max_stanzas() {
        let mut history = RoomHistory::new(HistoryStrategy::default());
        for i in 0..5 {
            history.add_message(chat(&format!("m{i}"), "hi"), Utc::now());
        }
        let request = HistoryRequest {
            max_stanzas: Some(2),
            ..Default::default()
        };
        let replayed = history.replay(&room_jid(), Some(&request));
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id.as_deref(), Some("m3"));
        assert_eq!(replayed[1].id.as_deref(), Some("m4"));
    }

    #[test]
    fn test_replay_respects_max_chars() {
        let mut history = RoomHistory::new(HistoryStrategy::default());
        history.add_message(chat("m0", "aaaaaaaaaa"), Utc::now());
        history.add_message(chat("m1", "bbbb"), Utc::now());
        history.add_message(chat("m2", "cc"), Utc::now());
        let request = HistoryRequest {
            max_chars: Some(7),
            ..Default::default()
        };
        let replayed = history.replay(&room_jid(), Some(&request));
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_replay_since_filters_old_messages() {
        let mut history = RoomHistory::new(HistoryStrategy::default());
        history.add_message(chat("old", "hi"), Utc::now() - chrono::Duration::hours(2));
        history.add_message(chat("new", "hi"), Utc::now());
        let request = HistoryRequest {
            since: Some(Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        };
        let replayed = history.replay(&room_jid(), Some(&request));
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id.as_deref(), Some("new"));
    }

    #[test]
    fn test_replay_attaches_delay_stamp() {
        let mut history = RoomHistory::new(HistoryStrategy::default());
        history.add_message(chat("m0", "hi"), Utc::now());
        let replayed = history.replay(&room_jid(), None);
        let delayed = Delay::try_from(replayed[0].payloads[0].clone());
        assert!(delayed.is_ok());
    }

    #[test]
    fn test_duplicate_ids_detected() {
        let mut history = RoomHistory::new(HistoryStrategy::default());
        history.add_message(chat("m0", "hi"), Utc::now());
        assert!(history.contains_id("m0"));
        assert!(!history.contains_id("m9"));
    }
}
