//! InMemoryOutbox - 開発用の outbox store
//!
//! # 実装詳細
//! - `HashMap<MessageId, StoredEntry>` behind a `std::sync::Mutex`; the lock
//!   is never held across an await
//! - every entry carries an insertion sequence so pages are stable when two
//!   entries share a write time
//! - transactional adds are staged in [`InMemoryTransaction`] and only become
//!   visible on [`InMemoryOutbox::commit`]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::domain::{Args, Message, MessageId, OutboxEntry, Page, RequestContext, Topic};
use crate::ports::clock::to_time_delta;
use crate::ports::{Clock, OutboxAsync, OutboxSync, StoreError, SystemClock};

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: OutboxEntry,
    seq: u64,
}

#[derive(Debug, Default)]
struct OutboxState {
    entries: HashMap<MessageId, StoredEntry>,
    next_seq: u64,
}

impl OutboxState {
    fn insert(&mut self, message: &Message, now: DateTime<Utc>) {
        if self.entries.contains_key(message.id()) {
            warn!(message_id = %message.id(), "message already in outbox, skipping duplicate add");
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            message.id().clone(),
            StoredEntry {
                entry: OutboxEntry::new(message.clone(), now),
                seq,
            },
        );
    }

    fn mark(&mut self, id: &MessageId, at: DateTime<Utc>) {
        match self.entries.get_mut(id) {
            Some(stored) => {
                if !stored.entry.mark_dispatched(at) {
                    debug!(message_id = %id, "message already marked dispatched");
                }
            }
            None => debug!(message_id = %id, "mark dispatched for unknown message ignored"),
        }
    }

    /// Entries matching `keep`, ordered by `key` then insertion, one page.
    fn page_of<K, F>(&self, page: Page, keep: F, key: K) -> Vec<Message>
    where
        F: Fn(&OutboxEntry) -> bool,
        K: Fn(&OutboxEntry) -> DateTime<Utc>,
    {
        let mut matching: Vec<&StoredEntry> = self
            .entries
            .values()
            .filter(|stored| keep(&stored.entry))
            .collect();
        matching.sort_by_key(|stored| (key(&stored.entry), stored.seq));
        matching
            .into_iter()
            .skip(page.offset())
            .take(page.size)
            .map(|stored| stored.entry.message.clone())
            .collect()
    }
}

/// Transaction handle for [`InMemoryOutbox`].
///
/// Dropping it without committing discards the staged messages.
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    staged: Mutex<Vec<Message>>,
}

impl InMemoryTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rollback(&self) {
        self.lock().clear();
    }

    pub fn staged_len(&self) -> usize {
        self.lock().len()
    }

    fn stage(&self, messages: &[Message]) {
        self.lock().extend_from_slice(messages);
    }

    fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory outbox store.
///
/// Cloning shares the underlying state.
#[derive(Clone)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<OutboxState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutboxState::default())),
            clock,
        }
    }

    /// Apply everything staged in `tx`, stamped with the commit time.
    pub fn commit(&self, tx: &InMemoryTransaction) {
        let staged = tx.take();
        let now = self.clock.now();
        let mut state = self.lock();
        for message in &staged {
            state.insert(message, now);
        }
        debug!(count = staged.len(), "committed outbox transaction");
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn entry(&self, id: &MessageId) -> Option<OutboxEntry> {
        self.lock()
            .entries
            .get(id)
            .map(|stored| stored.entry.clone())
    }

    fn lock(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_all(&self, messages: &[Message], tx: Option<&InMemoryTransaction>) {
        if let Some(tx) = tx {
            tx.stage(messages);
            return;
        }
        let now = self.clock.now();
        let mut state = self.lock();
        for message in messages {
            state.insert(message, now);
        }
    }

    fn get_message(&self, id: &MessageId) -> Option<Message> {
        self.lock()
            .entries
            .get(id)
            .map(|stored| stored.entry.message.clone())
    }

    fn mark_all(&self, ids: &[MessageId], at: DateTime<Utc>) {
        let mut state = self.lock();
        for id in ids {
            state.mark(id, at);
        }
    }

    fn outstanding(&self, min_age: Duration, page: Page, tripped_topics: &[Topic]) -> Vec<Message> {
        let now = self.clock.now();
        let min_age = to_time_delta(min_age);
        self.lock().page_of(
            page,
            |entry| {
                entry.is_outstanding(now, min_age)
                    && !tripped_topics.contains(entry.message.topic())
            },
            |entry| entry.write_time,
        )
    }

    fn outstanding_len(&self, min_age: Duration, tripped_topics: &[Topic]) -> usize {
        let now = self.clock.now();
        let min_age = to_time_delta(min_age);
        self.lock()
            .entries
            .values()
            .filter(|stored| {
                stored.entry.is_outstanding(now, min_age)
                    && !tripped_topics.contains(stored.entry.message.topic())
            })
            .count()
    }

    fn dispatched(&self, min_age: Duration, page: Page) -> Vec<Message> {
        let now = self.clock.now();
        let min_age = to_time_delta(min_age);
        self.lock().page_of(
            page,
            |entry| entry.is_dispatched_before(now, min_age),
            |entry| entry.dispatched_time.unwrap_or(entry.write_time),
        )
    }

    fn delete_all(&self, ids: &[MessageId]) {
        let mut state = self.lock();
        for id in ids {
            state.entries.remove(id);
        }
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxSync<InMemoryTransaction> for InMemoryOutbox {
    fn add(
        &self,
        message: &Message,
        _ctx: &RequestContext,
        _timeout: Duration,
        tx: Option<&InMemoryTransaction>,
    ) -> Result<(), StoreError> {
        self.add_all(std::slice::from_ref(message), tx);
        Ok(())
    }

    fn add_batch(
        &self,
        messages: &[Message],
        _ctx: &RequestContext,
        _timeout: Duration,
        tx: Option<&InMemoryTransaction>,
    ) -> Result<(), StoreError> {
        self.add_all(messages, tx);
        Ok(())
    }

    fn get(
        &self,
        id: &MessageId,
        _ctx: &RequestContext,
        _args: &Args,
    ) -> Result<Option<Message>, StoreError> {
        Ok(self.get_message(id))
    }

    fn mark_dispatched(
        &self,
        id: &MessageId,
        _ctx: &RequestContext,
        at: DateTime<Utc>,
        _args: &Args,
    ) -> Result<(), StoreError> {
        self.mark_all(std::slice::from_ref(id), at);
        Ok(())
    }

    fn mark_dispatched_many(
        &self,
        ids: &[MessageId],
        _ctx: &RequestContext,
        at: DateTime<Utc>,
        _args: &Args,
    ) -> Result<(), StoreError> {
        self.mark_all(ids, at);
        Ok(())
    }

    fn outstanding_messages(
        &self,
        min_age: Duration,
        _ctx: &RequestContext,
        page: Page,
        tripped_topics: &[Topic],
        _args: &Args,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.outstanding(min_age, page, tripped_topics))
    }

    fn dispatched_messages(
        &self,
        min_age: Duration,
        _ctx: &RequestContext,
        page: Page,
        _args: &Args,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.dispatched(min_age, page))
    }

    fn delete(
        &self,
        ids: &[MessageId],
        _ctx: &RequestContext,
        _args: &Args,
    ) -> Result<(), StoreError> {
        self.delete_all(ids);
        Ok(())
    }

    fn outstanding_count(
        &self,
        min_age: Duration,
        _ctx: &RequestContext,
        tripped_topics: &[Topic],
        _args: &Args,
    ) -> Result<usize, StoreError> {
        Ok(self.outstanding_len(min_age, tripped_topics))
    }
}

#[async_trait]
impl OutboxAsync<InMemoryTransaction> for InMemoryOutbox {
    async fn add(
        &self,
        message: &Message,
        _ctx: &RequestContext,
        _timeout: Duration,
        tx: Option<&InMemoryTransaction>,
    ) -> Result<(), StoreError> {
        self.add_all(std::slice::from_ref(message), tx);
        Ok(())
    }

    async fn add_batch(
        &self,
        messages: &[Message],
        _ctx: &RequestContext,
        _timeout: Duration,
        tx: Option<&InMemoryTransaction>,
    ) -> Result<(), StoreError> {
        self.add_all(messages, tx);
        Ok(())
    }

    async fn get(
        &self,
        id: &MessageId,
        _ctx: &RequestContext,
        _args: &Args,
    ) -> Result<Option<Message>, StoreError> {
        Ok(self.get_message(id))
    }

    async fn mark_dispatched(
        &self,
        id: &MessageId,
        _ctx: &RequestContext,
        at: DateTime<Utc>,
        _args: &Args,
    ) -> Result<(), StoreError> {
        self.mark_all(std::slice::from_ref(id), at);
        Ok(())
    }

    async fn mark_dispatched_many(
        &self,
        ids: &[MessageId],
        _ctx: &RequestContext,
        at: DateTime<Utc>,
        _args: &Args,
    ) -> Result<(), StoreError> {
        self.mark_all(ids, at);
        Ok(())
    }

    async fn outstanding_messages(
        &self,
        min_age: Duration,
        _ctx: &RequestContext,
        page: Page,
        tripped_topics: &[Topic],
        _args: &Args,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.outstanding(min_age, page, tripped_topics))
    }

    async fn dispatched_messages(
        &self,
        min_age: Duration,
        _ctx: &RequestContext,
        page: Page,
        _args: &Args,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.dispatched(min_age, page))
    }

    async fn delete(
        &self,
        ids: &[MessageId],
        _ctx: &RequestContext,
        _args: &Args,
    ) -> Result<(), StoreError> {
        self.delete_all(ids);
        Ok(())
    }

    async fn outstanding_count(
        &self,
        min_age: Duration,
        _ctx: &RequestContext,
        tripped_topics: &[Topic],
        _args: &Args,
    ) -> Result<usize, StoreError> {
        Ok(self.outstanding_len(min_age, tripped_topics))
    }
}
