//! Outbox entry: message + write/dispatch timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;

/// Where an entry is in its life.
///
/// State transitions:
/// - Added -> Dispatched (direct mark or confirmation callback)
/// - Dispatched -> (archived: removed from the store, so no variant)
///
/// There is no failed state. An entry that never gets sent stays `Added`
/// and remains eligible for the next sweep or explicit clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    Added,
    Dispatched,
}

/// A message as held by an outbox store.
///
/// - `write_time` is set at insertion and never changes.
/// - `dispatched_time` is set once; later marks are ignored so replayed
///   confirmations are harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message: Message,
    pub write_time: DateTime<Utc>,
    pub dispatched_time: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn new(message: Message, write_time: DateTime<Utc>) -> Self {
        Self {
            message,
            write_time,
            dispatched_time: None,
        }
    }

    pub fn state(&self) -> EntryState {
        if self.dispatched_time.is_some() {
            EntryState::Dispatched
        } else {
            EntryState::Added
        }
    }

    /// Mark dispatched. Returns `false` when it was already marked.
    pub fn mark_dispatched(&mut self, at: DateTime<Utc>) -> bool {
        if self.dispatched_time.is_some() {
            return false;
        }
        self.dispatched_time = Some(at);
        true
    }

    /// Undispatched and written at least `min_age` before `now`.
    pub fn is_outstanding(&self, now: DateTime<Utc>, min_age: chrono::Duration) -> bool {
        self.dispatched_time.is_none() && now - self.write_time >= min_age
    }

    /// Dispatched at least `min_age` before `now`.
    pub fn is_dispatched_before(&self, now: DateTime<Utc>, min_age: chrono::Duration) -> bool {
        self.dispatched_time
            .is_some_and(|dispatched| now - dispatched >= min_age)
    }
}
