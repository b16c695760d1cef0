//! Deposits: single adds and batches.

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use super::{OutboxProducerMediator, cancellable};
use crate::domain::{BatchId, Message, RequestContext};
use crate::error::{OutboxError, OutboxResult};

impl<Tx: Send + Sync + 'static> OutboxProducerMediator<Tx> {
    /// Write `message` to the outbox, or hold it in `batch_id` until
    /// [`end_batch`](Self::end_batch).
    ///
    /// Fails with `LimitReached` before writing anything when the backlog is
    /// over the limit, and with `ChannelFailure` when the write exhausts the
    /// retry policy.
    pub fn add_to_outbox(
        &self,
        message: Message,
        ctx: &RequestContext,
        tx: Option<&Tx>,
        batch_id: Option<BatchId>,
    ) -> OutboxResult<()> {
        if let Some(batch_id) = batch_id {
            return self.append_to_batch(batch_id, message);
        }
        self.guard_outstanding_limit(ctx)?;

        let store = self.sync_outbox.as_ref().ok_or(OutboxError::NoOutbox)?;
        let span = info_span!(parent: &ctx.span, "outbox.add", message_id = %message.id());
        let _entered = span.enter();

        self.retry
            .execute(|| store.add(&message, ctx, self.config.outbox_timeout, tx))
            .map_err(|err| {
                self.retry_failed(ctx, &err);
                OutboxError::ChannelFailure(format!(
                    "could not write message {} to the outbox: {err}",
                    message.id()
                ))
            })?;
        debug!(message_id = %message.id(), topic = %message.topic(), "message written to outbox");
        Ok(())
    }

    pub async fn add_to_outbox_async(
        &self,
        message: Message,
        ctx: &RequestContext,
        tx: Option<&Tx>,
        batch_id: Option<BatchId>,
        cancel: &CancellationToken,
    ) -> OutboxResult<()> {
        if let Some(batch_id) = batch_id {
            return self.append_to_batch(batch_id, message);
        }
        self.guard_outstanding_limit(ctx)?;

        let store = self.async_outbox.as_ref().ok_or(OutboxError::NoAsyncOutbox)?;
        let span = info_span!(parent: &ctx.span, "outbox.add", message_id = %message.id());

        let write = async {
            self.retry
                .execute_async(|| store.add(&message, ctx, self.config.outbox_timeout, tx))
                .await
                .map_err(|err| {
                    self.retry_failed(ctx, &err);
                    OutboxError::ChannelFailure(format!(
                        "could not write message {} to the outbox: {err}",
                        message.id()
                    ))
                })
        };
        cancellable(cancel, write.instrument(span)).await?;
        debug!(message_id = %message.id(), topic = %message.topic(), "message written to outbox");
        Ok(())
    }

    /// Open a batch. Messages added with its id are held in memory.
    pub fn start_batch(&self) -> BatchId {
        let batch_id = BatchId::generate();
        self.lock_batches().insert(batch_id, Vec::new());
        debug!(batch_id = %batch_id, "batch started");
        batch_id
    }

    /// Flush a batch as one bulk write. The batch is discarded only after a
    /// successful write, so a failed flush can be retried.
    pub fn end_batch(
        &self,
        batch_id: BatchId,
        ctx: &RequestContext,
        tx: Option<&Tx>,
    ) -> OutboxResult<()> {
        let messages = self.batch_messages(batch_id)?;
        self.guard_outstanding_limit(ctx)?;

        let store = self.sync_outbox.as_ref().ok_or(OutboxError::NoOutbox)?;
        let span = info_span!(parent: &ctx.span, "outbox.end_batch", batch_id = %batch_id, count = messages.len());
        let _entered = span.enter();

        self.retry
            .execute(|| store.add_batch(&messages, ctx, self.config.outbox_timeout, tx))
            .map_err(|err| self.batch_failed(ctx, batch_id, &err))?;

        self.lock_batches().remove(&batch_id);
        info!(batch_id = %batch_id, count = messages.len(), "batch written to outbox");
        Ok(())
    }

    pub async fn end_batch_async(
        &self,
        batch_id: BatchId,
        ctx: &RequestContext,
        tx: Option<&Tx>,
        cancel: &CancellationToken,
    ) -> OutboxResult<()> {
        let messages = self.batch_messages(batch_id)?;
        self.guard_outstanding_limit(ctx)?;

        let store = self.async_outbox.as_ref().ok_or(OutboxError::NoAsyncOutbox)?;
        let span = info_span!(parent: &ctx.span, "outbox.end_batch", batch_id = %batch_id, count = messages.len());

        let write = async {
            self.retry
                .execute_async(|| {
                    store.add_batch(&messages, ctx, self.config.outbox_timeout, tx)
                })
                .await
                .map_err(|err| self.batch_failed(ctx, batch_id, &err))
        };
        cancellable(cancel, write.instrument(span)).await?;

        self.lock_batches().remove(&batch_id);
        info!(batch_id = %batch_id, count = messages.len(), "batch written to outbox");
        Ok(())
    }

    /// Limit check, then a (rate-limited) count refresh whether or not the
    /// check passed, so a full outbox can drain its way back under the limit.
    fn guard_outstanding_limit(&self, ctx: &RequestContext) -> OutboxResult<()> {
        let within_limit = self.check_outbox_outstanding_limit();
        self.check_outstanding_messages(ctx);
        within_limit
    }

    fn append_to_batch(&self, batch_id: BatchId, message: Message) -> OutboxResult<()> {
        let mut batches = self.lock_batches();
        let batch = batches
            .get_mut(&batch_id)
            .ok_or(OutboxError::UnknownBatch(batch_id))?;
        debug!(batch_id = %batch_id, message_id = %message.id(), "message added to batch");
        batch.push(message);
        Ok(())
    }

    fn batch_messages(&self, batch_id: BatchId) -> OutboxResult<Vec<Message>> {
        self.lock_batches()
            .get(&batch_id)
            .cloned()
            .ok_or(OutboxError::UnknownBatch(batch_id))
    }

    fn batch_failed<E: std::fmt::Display>(
        &self,
        ctx: &RequestContext,
        batch_id: BatchId,
        err: &crate::resilience::RetryError<E>,
    ) -> OutboxError {
        self.retry_failed(ctx, err);
        OutboxError::ChannelFailure(format!("could not write batch {batch_id} to the outbox: {err}"))
    }
}
