//! OutboxArchiver - 配信済みメッセージのアーカイブ
//!
//! One pass moves at most one page of dispatched messages to the archive
//! provider, then deletes that page from the outbox. The delete only
//! happens when every message in the page was archived; a provider failure
//! leaves the page in place for the next pass.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use crate::domain::{Args, Message, MessageId, Page, RequestContext};
use crate::error::{OutboxError, OutboxResult};
use crate::ports::{ArchiveError, ArchiveProvider, OutboxAsync, OutboxSync};

pub struct OutboxArchiver<Tx: Send + Sync + 'static> {
    sync_outbox: Option<Arc<dyn OutboxSync<Tx>>>,
    async_outbox: Option<Arc<dyn OutboxAsync<Tx>>>,
    provider: Arc<dyn ArchiveProvider>,
    batch_size: usize,
    args: Args,
}

impl<Tx: Send + Sync + 'static> OutboxArchiver<Tx> {
    pub fn new(
        sync_outbox: Option<Arc<dyn OutboxSync<Tx>>>,
        async_outbox: Option<Arc<dyn OutboxAsync<Tx>>>,
        provider: Arc<dyn ArchiveProvider>,
        batch_size: usize,
    ) -> Self {
        Self {
            sync_outbox,
            async_outbox,
            provider,
            batch_size: batch_size.max(1),
            args: Args::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Archive one page of messages dispatched at least `min_age` ago.
    /// Returns how many were archived.
    pub fn archive(&self, min_age: Duration, ctx: &RequestContext) -> OutboxResult<usize> {
        let store = self.sync_outbox.as_ref().ok_or(OutboxError::NoOutbox)?;
        let span = info_span!(parent: &ctx.span, "outbox.archive", batch_size = self.batch_size);
        let _entered = span.enter();

        let messages = store
            .dispatched_messages(min_age, ctx, Page::first(self.batch_size), &self.args)
            .map_err(ArchiveError::from)?;
        if messages.is_empty() {
            debug!("no dispatched messages old enough to archive");
            return Ok(0);
        }

        for message in &messages {
            self.provider
                .archive_message(message)
                .inspect_err(|err| archive_failed(message, err))?;
        }

        let ids = ids_of(&messages);
        store
            .delete(&ids, ctx, &self.args)
            .map_err(ArchiveError::from)?;
        info!(count = ids.len(), "archived messages");
        Ok(ids.len())
    }

    pub async fn archive_async(
        &self,
        min_age: Duration,
        ctx: &RequestContext,
        cancel: &CancellationToken,
    ) -> OutboxResult<usize> {
        let store = self.async_outbox.as_ref().ok_or(OutboxError::NoAsyncOutbox)?;
        let span = info_span!(parent: &ctx.span, "outbox.archive", batch_size = self.batch_size);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OutboxError::Cancelled),
            result = self.archive_page_async(store.as_ref(), min_age, ctx).instrument(span) => result,
        }
    }

    async fn archive_page_async(
        &self,
        store: &dyn OutboxAsync<Tx>,
        min_age: Duration,
        ctx: &RequestContext,
    ) -> OutboxResult<usize> {
        let messages = store
            .dispatched_messages(min_age, ctx, Page::first(self.batch_size), &self.args)
            .await
            .map_err(ArchiveError::from)?;
        if messages.is_empty() {
            debug!("no dispatched messages old enough to archive");
            return Ok(0);
        }

        for message in &messages {
            self.provider
                .archive_message_async(message)
                .await
                .inspect_err(|err| archive_failed(message, err))?;
        }

        let ids = ids_of(&messages);
        store
            .delete(&ids, ctx, &self.args)
            .await
            .map_err(ArchiveError::from)?;
        info!(count = ids.len(), "archived messages");
        Ok(ids.len())
    }
}

fn ids_of(messages: &[Message]) -> Vec<MessageId> {
    messages.iter().map(|m| m.id().clone()).collect()
}

fn archive_failed(message: &Message, err: &ArchiveError) {
    error!(message_id = %message.id(), error = %err, "error while archiving from the outbox");
}
