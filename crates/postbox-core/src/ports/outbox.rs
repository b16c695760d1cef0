//! Outbox store port.
//!
//! Two traits, one per calling style. Blocking callers (typically inside an
//! already-open synchronous business transaction) use [`OutboxSync`];
//! async callers use [`OutboxAsync`]. A store may implement either or both.
//!
//! `Tx` is the store's transaction handle. Passing `Some(tx)` to `add`
//! enlists the write in that transaction, so the message commits together
//! with the caller's business changes.
//!
//! Contract shared by both traits:
//! - duplicate adds (same id) are logged and skipped, never an error
//! - `mark_dispatched*` only sets `dispatched_time` when it is unset
//! - `outstanding_messages` / `dispatched_messages` are read-only

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Args, Message, MessageId, Page, RequestContext, Topic};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("outbox operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("outbox backend error: {0}")]
    Backend(String),

    #[error("outbox transaction error: {0}")]
    Transaction(String),
}

pub trait OutboxSync<Tx>: Send + Sync {
    fn add(
        &self,
        message: &Message,
        ctx: &RequestContext,
        timeout: Duration,
        tx: Option<&Tx>,
    ) -> Result<(), StoreError>;

    fn add_batch(
        &self,
        messages: &[Message],
        ctx: &RequestContext,
        timeout: Duration,
        tx: Option<&Tx>,
    ) -> Result<(), StoreError>;

    fn get(
        &self,
        id: &MessageId,
        ctx: &RequestContext,
        args: &Args,
    ) -> Result<Option<Message>, StoreError>;

    fn mark_dispatched(
        &self,
        id: &MessageId,
        ctx: &RequestContext,
        at: DateTime<Utc>,
        args: &Args,
    ) -> Result<(), StoreError>;

    fn mark_dispatched_many(
        &self,
        ids: &[MessageId],
        ctx: &RequestContext,
        at: DateTime<Utc>,
        args: &Args,
    ) -> Result<(), StoreError>;

    /// Undispatched messages written at least `min_age` ago, oldest first,
    /// excluding `tripped_topics`.
    fn outstanding_messages(
        &self,
        min_age: Duration,
        ctx: &RequestContext,
        page: Page,
        tripped_topics: &[Topic],
        args: &Args,
    ) -> Result<Vec<Message>, StoreError>;

    /// Messages dispatched at least `min_age` ago.
    fn dispatched_messages(
        &self,
        min_age: Duration,
        ctx: &RequestContext,
        page: Page,
        args: &Args,
    ) -> Result<Vec<Message>, StoreError>;

    fn delete(
        &self,
        ids: &[MessageId],
        ctx: &RequestContext,
        args: &Args,
    ) -> Result<(), StoreError>;

    /// Size of the outstanding set. Stores with a cheap count query should
    /// override this.
    fn outstanding_count(
        &self,
        min_age: Duration,
        ctx: &RequestContext,
        tripped_topics: &[Topic],
        args: &Args,
    ) -> Result<usize, StoreError> {
        self.outstanding_messages(min_age, ctx, Page::all(), tripped_topics, args)
            .map(|messages| messages.len())
    }
}

#[async_trait]
pub trait OutboxAsync<Tx: Sync>: Send + Sync {
    async fn add(
        &self,
        message: &Message,
        ctx: &RequestContext,
        timeout: Duration,
        tx: Option<&Tx>,
    ) -> Result<(), StoreError>;

    async fn add_batch(
        &self,
        messages: &[Message],
        ctx: &RequestContext,
        timeout: Duration,
        tx: Option<&Tx>,
    ) -> Result<(), StoreError>;

    async fn get(
        &self,
        id: &MessageId,
        ctx: &RequestContext,
        args: &Args,
    ) -> Result<Option<Message>, StoreError>;

    async fn mark_dispatched(
        &self,
        id: &MessageId,
        ctx: &RequestContext,
        at: DateTime<Utc>,
        args: &Args,
    ) -> Result<(), StoreError>;

    async fn mark_dispatched_many(
        &self,
        ids: &[MessageId],
        ctx: &RequestContext,
        at: DateTime<Utc>,
        args: &Args,
    ) -> Result<(), StoreError>;

    async fn outstanding_messages(
        &self,
        min_age: Duration,
        ctx: &RequestContext,
        page: Page,
        tripped_topics: &[Topic],
        args: &Args,
    ) -> Result<Vec<Message>, StoreError>;

    async fn dispatched_messages(
        &self,
        min_age: Duration,
        ctx: &RequestContext,
        page: Page,
        args: &Args,
    ) -> Result<Vec<Message>, StoreError>;

    async fn delete(
        &self,
        ids: &[MessageId],
        ctx: &RequestContext,
        args: &Args,
    ) -> Result<(), StoreError>;

    async fn outstanding_count(
        &self,
        min_age: Duration,
        ctx: &RequestContext,
        tripped_topics: &[Topic],
        args: &Args,
    ) -> Result<usize, StoreError> {
        self.outstanding_messages(min_age, ctx, Page::all(), tripped_topics, args)
            .await
            .map(|messages| messages.len())
    }
}
