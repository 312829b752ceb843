//! [`DispatchSink`] – where the dispatcher delivers plugin output – and the
//! default in-memory [`StatusBoard`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use robohub_types::Identifier;
use serde::Serialize;
use serde_json::Value;

/// Entries kept in the message log and the event log.
pub const MESSAGE_LOG_CAPACITY: usize = 100;

/// Receives the user-visible effects of plugin commands.
///
/// Every method defaults to a no-op so a sink only implements what it
/// cares about.
pub trait DispatchSink: Send + Sync {
    /// The plugin's displayed status is now `state`.
    fn on_state_change(&self, _origin: &Identifier, _state: &str) {}

    fn on_message(&self, _origin: &Identifier, _text: &str) {}

    fn on_event(&self, _origin: &Identifier, _name: &str, _payload: &Value) {}
}

// ────────────────────────────────────────────────────────────────────────────
// Entries
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEntry {
    pub origin: Identifier,
    pub state: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageEntry {
    pub origin: Identifier,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEntry {
    pub origin: Identifier,
    pub name: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Everything the board holds, for serialization in one piece.
#[derive(Debug, Clone, Serialize)]
pub struct BoardSnapshot {
    pub statuses: Vec<StatusEntry>,
    pub messages: Vec<MessageEntry>,
    pub events: Vec<EventEntry>,
}

// ────────────────────────────────────────────────────────────────────────────
// StatusBoard
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BoardState {
    statuses: BTreeMap<Identifier, StatusEntry>,
    messages: VecDeque<MessageEntry>,
    events: VecDeque<EventEntry>,
}

/// Latest status per plugin plus bounded message and event logs.
///
/// # Example
///
/// ```
/// use robohub_kernel::status::{DispatchSink, StatusBoard};
/// use robohub_types::Identifier;
///
/// let board = StatusBoard::new();
/// let origin = Identifier::new("weather", "Ada", "Forecaster");
/// board.on_state_change(&origin, "sunny");
/// board.on_state_change(&origin, "rainy");
///
/// assert_eq!(board.statuses().len(), 1);
/// assert_eq!(board.statuses()[0].state, "rainy");
/// ```
#[derive(Debug)]
pub struct StatusBoard {
    state: Mutex<BoardState>,
    capacity: usize,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::with_capacity(MESSAGE_LOG_CAPACITY)
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn statuses(&self) -> Vec<StatusEntry> {
        self.lock().statuses.values().cloned().collect()
    }

    pub fn status_of(&self, origin: &Identifier) -> Option<String> {
        self.lock().statuses.get(origin).map(|e| e.state.clone())
    }

    /// Message log, oldest first.
    pub fn messages(&self) -> Vec<MessageEntry> {
        self.lock().messages.iter().cloned().collect()
    }

    pub fn events(&self) -> Vec<EventEntry> {
        self.lock().events.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let state = self.lock();
        BoardSnapshot {
            statuses: state.statuses.values().cloned().collect(),
            messages: state.messages.iter().cloned().collect(),
            events: state.events.iter().cloned().collect(),
        }
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, capacity: usize) {
    while log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(item);
}

impl DispatchSink for StatusBoard {
    fn on_state_change(&self, origin: &Identifier, state: &str) {
        self.lock().statuses.insert(
            origin.clone(),
            StatusEntry {
                origin: origin.clone(),
                state: state.to_string(),
                updated_at: Utc::now(),
            },
        );
    }

    fn on_message(&self, origin: &Identifier, text: &str) {
        let capacity = self.capacity;
        let entry = MessageEntry {
            origin: origin.clone(),
            text: text.to_string(),
            received_at: Utc::now(),
        };
        push_bounded(&mut self.lock().messages, entry, capacity);
    }

    fn on_event(&self, origin: &Identifier, name: &str, payload: &Value) {
        let capacity = self.capacity;
        let entry = EventEntry {
            origin: origin.clone(),
            name: name.to_string(),
            payload: payload.clone(),
            received_at: Utc::now(),
        };
        push_bounded(&mut self.lock().events, entry, capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn origin(id: &str) -> Identifier {
        Identifier::new(id, "Ada", id.to_uppercase())
    }

    #[test]
    fn status_is_replaced_per_identity() {
        let board = StatusBoard::new();
        board.on_state_change(&origin("a"), "one");
        board.on_state_change(&origin("b"), "two");
        board.on_state_change(&origin("a"), "three");

        assert_eq!(board.status_of(&origin("a")).as_deref(), Some("three"));
        assert_eq!(board.status_of(&origin("b")).as_deref(), Some("two"));
        assert_eq!(board.statuses().len(), 2);
    }

    #[test]
    fn message_log_drops_oldest_beyond_capacity() {
        let board = StatusBoard::new();
        for i in 0..150 {
            board.on_message(&origin("a"), &format!("m{i}"));
        }
        let messages = board.messages();
        assert_eq!(messages.len(), MESSAGE_LOG_CAPACITY);
        assert_eq!(messages[0].text, "m50");
        assert_eq!(messages[99].text, "m149");
    }

    #[test]
    fn events_are_recorded_with_payload() {
        let board = StatusBoard::with_capacity(2);
        board.on_event(&origin("a"), "wave", &json!({"hand": "left"}));
        board.on_event(&origin("a"), "blink", &Value::Null);
        board.on_event(&origin("a"), "nod", &json!(3));

        let names: Vec<String> = board.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["blink", "nod"]);
    }

    #[test]
    fn snapshot_serializes() {
        let board = StatusBoard::new();
        board.on_state_change(&origin("a"), "ok");
        board.on_message(&origin("a"), "hello");
        let json = serde_json::to_value(board.snapshot()).unwrap();
        assert_eq!(json["statuses"][0]["state"], "ok");
        assert_eq!(json["messages"][0]["text"], "hello");
        assert_eq!(json["events"], json!([]));
    }
}
