//! Background sweeps of the outstanding set.

use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::gate::GatePermit;
use super::{OutboxProducerMediator, cancellable};
use crate::domain::{Args, Message, Page, RequestContext, Topic};
use crate::error::{OutboxError, OutboxResult};
use crate::ports::OutboxAsync;

/// What one sweep attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep or clear held a gate; nothing was read.
    Skipped,
    Swept {
        found: usize,
        dispatched: usize,
        failed: usize,
    },
    /// The outstanding query itself failed, or the sweep was cancelled.
    Failed,
}

impl SweepOutcome {
    fn swept(found: usize, tally: Tally) -> Self {
        SweepOutcome::Swept {
            found,
            dispatched: tally.dispatched,
            failed: tally.failed,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    dispatched: usize,
    failed: usize,
}

impl<Tx: Send + Sync + 'static> OutboxProducerMediator<Tx> {
    /// Dispatch up to `amount` outstanding messages at least `min_age` old.
    ///
    /// Never waits: if a sweep or an explicit clear is already running this
    /// returns [`SweepOutcome::Skipped`]. A message that fails to send trips
    /// its topic in the outbox circuit breaker and the sweep moves on.
    ///
    /// There is no blocking bulk producer, so `use_bulk` still dispatches
    /// one message at a time here.
    pub fn clear_outstanding_from_outbox(
        &self,
        amount: usize,
        min_age: Duration,
        use_bulk: bool,
        ctx: &RequestContext,
        args: &Args,
    ) -> SweepOutcome {
        self.cool_down();
        let Some(store) = self.sync_outbox.as_ref() else {
            error!("no synchronous outbox configured, cannot sweep");
            return SweepOutcome::Failed;
        };
        let Some(permits) = self.enter_sweep() else {
            return SweepOutcome::Skipped;
        };
        if use_bulk {
            debug!("bulk dispatch needs the async sweep, dispatching one by one");
        }

        let span = info_span!(parent: &ctx.span, "outbox.sweep", amount, use_bulk);
        let _entered = span.enter();
        let tripped = self.tripped_topics();
        let outstanding =
            match store.outstanding_messages(min_age, ctx, Page::first(amount), &tripped, args) {
                Ok(messages) => messages,
                Err(err) => {
                    error!(error = %err, "could not read outstanding messages");
                    return SweepOutcome::Failed;
                }
            };
        info!(found = outstanding.len(), "found messages to clear");

        let mut tally = Tally::default();
        for message in &outstanding {
            let sent = self.dispatch_blocking(store.as_ref(), message, ctx, args);
            self.record(&mut tally, message.topic(), sent);
        }
        drop(permits);

        self.check_outstanding_messages(ctx);
        SweepOutcome::swept(outstanding.len(), tally)
    }

    /// Async form of [`clear_outstanding_from_outbox`](Self::clear_outstanding_from_outbox).
    ///
    /// With `use_bulk`, messages are grouped by topic and each group goes out
    /// through the topic's bulk producer in one call.
    pub async fn clear_outstanding_from_outbox_async(
        &self,
        amount: usize,
        min_age: Duration,
        use_bulk: bool,
        ctx: &RequestContext,
        args: &Args,
        cancel: &CancellationToken,
    ) -> SweepOutcome {
        self.cool_down();
        let Some(store) = self.async_outbox.as_ref() else {
            error!("no async outbox configured, cannot sweep");
            return SweepOutcome::Failed;
        };
        let Some(permits) = self.enter_sweep() else {
            return SweepOutcome::Skipped;
        };

        let span = info_span!(parent: &ctx.span, "outbox.sweep", amount, use_bulk);
        let sweep = async {
            let tripped = self.tripped_topics();
            let outstanding = store
                .outstanding_messages(min_age, ctx, Page::first(amount), &tripped, args)
                .await?;
            info!(found = outstanding.len(), "found messages to clear");

            let tally = if use_bulk {
                self.bulk_dispatch_async(store.as_ref(), &outstanding, ctx, args)
                    .await
            } else {
                let mut tally = Tally::default();
                for message in &outstanding {
                    let sent = self.dispatch_async(store.as_ref(), message, ctx, args).await;
                    self.record(&mut tally, message.topic(), sent);
                }
                tally
            };
            OutboxResult::Ok(SweepOutcome::swept(outstanding.len(), tally))
        };
        let outcome = cancellable(cancel, sweep.instrument(span)).await;
        drop(permits);

        self.check_outstanding_messages(ctx);
        outcome.unwrap_or_else(|err| {
            error!(error = %err, "outbox sweep did not complete");
            SweepOutcome::Failed
        })
    }

    /// Send each topic's messages as one bulk call, topics in the order they
    /// first appear.
    async fn bulk_dispatch_async(
        &self,
        store: &dyn OutboxAsync<Tx>,
        messages: &[Message],
        ctx: &RequestContext,
        args: &Args,
    ) -> Tally {
        let mut tally = Tally::default();
        for (topic, batch) in group_by_topic(messages) {
            let producer = match self.registry.lookup_by_topic(&topic) {
                Ok(producer) => producer,
                Err(err) => {
                    error!(topic = %topic, error = %err, "no producer for bulk dispatch");
                    tally.failed += batch.len();
                    continue;
                }
            };
            let Some(sender) = producer.bulk() else {
                let err = OutboxError::MissingCapability {
                    capability: "async bulk",
                    topic: topic.clone(),
                };
                error!(topic = %topic, error = %err, "cannot bulk dispatch");
                tally.failed += batch.len();
                continue;
            };

            debug!(topic = %topic, count = batch.len(), "bulk dispatching messages");
            let confirms = producer.confirms_publication();
            let mut any_failed = false;
            let mut results = sender.send_batch(batch);
            while let Some(result) = results.next().await {
                match result {
                    Ok(id) => {
                        tally.dispatched += 1;
                        if !confirms {
                            self.mark_dispatched_async(store, &id, ctx, args).await;
                        }
                    }
                    Err(err) => {
                        warn!(topic = %topic, error = %err, "bulk send of message failed");
                        tally.failed += 1;
                        any_failed = true;
                    }
                }
            }
            if any_failed {
                self.trip_topic(&topic);
            }
        }
        tally
    }

    /// Both gates or neither. The sweep gate is taken first so two sweeps
    /// never contend on the clear gate.
    fn enter_sweep(&self) -> Option<(GatePermit, GatePermit)> {
        let entered = self
            .sweep_gate
            .try_enter()
            .and_then(|sweep| self.clear_gate.try_enter().map(|clear| (sweep, clear)));
        if entered.is_none() {
            warn!("skipping dispatch of messages as another thread is running");
        }
        entered
    }

    fn record(&self, tally: &mut Tally, topic: &Topic, sent: OutboxResult<()>) {
        match sent {
            Ok(()) => tally.dispatched += 1,
            Err(OutboxError::ChannelFailure(reason)) => {
                warn!(topic = %topic, reason = %reason, "send failed, tripping topic");
                self.trip_topic(topic);
                tally.failed += 1;
            }
            Err(err) => {
                error!(topic = %topic, error = %err, "could not dispatch message");
                tally.failed += 1;
            }
        }
    }
}

fn group_by_topic(messages: &[Message]) -> Vec<(Topic, Vec<Message>)> {
    let mut groups: Vec<(Topic, Vec<Message>)> = Vec::new();
    for message in messages {
        match groups.iter_mut().find(|(topic, _)| topic == message.topic()) {
            Some((_, batch)) => batch.push(message.clone()),
            None => groups.push((message.topic().clone(), vec![message.clone()])),
        }
    }
    groups
}
