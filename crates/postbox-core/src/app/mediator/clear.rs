//! Explicit clear and per-message dispatch.

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use super::{OutboxProducerMediator, cancellable};
use crate::domain::{Args, Message, MessageId, RequestContext};
use crate::error::{OutboxError, OutboxResult};
use crate::ports::{OutboxAsync, OutboxSync};

impl<Tx: Send + Sync + 'static> OutboxProducerMediator<Tx> {
    /// Dispatch the named messages now, in the order given.
    ///
    /// Holds the clear gate for the whole call, waiting for it if a sweep or
    /// another clear has it. The first id that is missing, unusable, or
    /// fails to send aborts the call; later ids are left untouched.
    pub fn clear_outbox(
        &self,
        ids: &[MessageId],
        ctx: &RequestContext,
        args: &Args,
    ) -> OutboxResult<()> {
        let store = self.sync_outbox.as_ref().ok_or(OutboxError::NoOutbox)?;
        let span = info_span!(parent: &ctx.span, "outbox.clear", count = ids.len());

        let result = {
            let _permit = self.clear_gate.enter_blocking()?;
            let _entered = span.enter();
            ids.iter().try_for_each(|id| {
                let cleared = store
                    .get(id, ctx, args)
                    .map_err(OutboxError::from)
                    .and_then(|found| fetch_dispatchable(found, id))
                    .and_then(|message| {
                        self.dispatch_blocking(store.as_ref(), &message, ctx, args)
                    });
                cleared.map_err(|err| clear_failed(id, err))
            })
        };

        self.check_outstanding_messages(ctx);
        result
    }

    pub async fn clear_outbox_async(
        &self,
        ids: &[MessageId],
        ctx: &RequestContext,
        args: &Args,
        cancel: &CancellationToken,
    ) -> OutboxResult<()> {
        let store = self.async_outbox.as_ref().ok_or(OutboxError::NoAsyncOutbox)?;
        let span = info_span!(parent: &ctx.span, "outbox.clear", count = ids.len());

        let clear = async {
            let _permit = self.clear_gate.enter().await?;
            for id in ids {
                self.clear_one_async(store.as_ref(), id, ctx, args)
                    .await
                    .map_err(|err| clear_failed(id, err))?;
            }
            Ok(())
        };
        let result = cancellable(cancel, clear.instrument(span)).await;

        self.check_outstanding_messages(ctx);
        result
    }

    async fn clear_one_async(
        &self,
        store: &dyn OutboxAsync<Tx>,
        id: &MessageId,
        ctx: &RequestContext,
        args: &Args,
    ) -> OutboxResult<()> {
        let message = fetch_dispatchable(store.get(id, ctx, args).await?, id)?;
        self.dispatch_async(store, &message, ctx, args).await
    }

    /// Send one message through its producer's blocking capability.
    ///
    /// A producer that confirms publication marks the message later, from
    /// its callback. Any other producer's message is marked here, right
    /// after a successful send.
    pub(super) fn dispatch_blocking(
        &self,
        store: &dyn OutboxSync<Tx>,
        message: &Message,
        ctx: &RequestContext,
        args: &Args,
    ) -> OutboxResult<()> {
        let producer = self.registry.lookup_by_topic(message.topic())?;
        let sender = producer
            .sync()
            .ok_or_else(|| OutboxError::MissingCapability {
                capability: "sync",
                topic: message.topic().clone(),
            })?;
        debug!(topic = %message.topic(), message_id = %message.id(), "decoupled invocation of message");

        self.retry
            .execute(|| sender.send(message))
            .map_err(|err| {
                self.retry_failed(ctx, &err);
                send_failed(message, &err)
            })?;

        if producer.confirms_publication() {
            debug!(message_id = %message.id(), "awaiting publish confirmation");
            return Ok(());
        }
        self.mark_dispatched_blocking(store, message.id(), ctx, args);
        info!(message_id = %message.id(), topic = %message.topic(), "message dispatched");
        Ok(())
    }

    pub(super) async fn dispatch_async(
        &self,
        store: &dyn OutboxAsync<Tx>,
        message: &Message,
        ctx: &RequestContext,
        args: &Args,
    ) -> OutboxResult<()> {
        let producer = self.registry.lookup_by_topic(message.topic())?;
        let sender = producer
            .asynchronous()
            .ok_or_else(|| OutboxError::MissingCapability {
                capability: "async",
                topic: message.topic().clone(),
            })?;
        debug!(topic = %message.topic(), message_id = %message.id(), "decoupled invocation of message");

        self.retry
            .execute_async(|| sender.send_async(message))
            .await
            .map_err(|err| {
                self.retry_failed(ctx, &err);
                send_failed(message, &err)
            })?;

        if producer.confirms_publication() {
            debug!(message_id = %message.id(), "awaiting publish confirmation");
            return Ok(());
        }
        self.mark_dispatched_async(store, message.id(), ctx, args)
            .await;
        info!(message_id = %message.id(), topic = %message.topic(), "message dispatched");
        Ok(())
    }
}

/// A fetched message is usable when it exists and its type can be sent.
fn fetch_dispatchable(found: Option<Message>, id: &MessageId) -> OutboxResult<Message> {
    found
        .filter(|message| message.header().message_type().is_dispatchable())
        .ok_or_else(|| OutboxError::NotFound(id.clone()))
}

/// `NotFound` and `ChannelFailure` already name the message; anything else
/// is wrapped so the caller learns which id stopped the clear.
fn clear_failed(id: &MessageId, err: OutboxError) -> OutboxError {
    match err {
        OutboxError::NotFound(_) | OutboxError::ChannelFailure(_) => err,
        other => OutboxError::ClearFailed {
            id: id.clone(),
            source: Box::new(other),
        },
    }
}

fn send_failed(message: &Message, err: &impl std::fmt::Display) -> OutboxError {
    OutboxError::ChannelFailure(format!(
        "could not send message {} to topic {}: {err}",
        message.id(),
        message.topic()
    ))
}
