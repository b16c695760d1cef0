//! OutboxProducerMediator - outbox と producer の仲介
//!
//! Sits between the outbox store and the broker producers:
//! - deposits messages (single or batched) behind the outstanding limit
//! - dispatches named messages on demand (explicit clear)
//! - sweeps outstanding messages in the background
//! - archives aged dispatched messages
//!
//! # 排他制御
//! Three gates per mediator instance, never process-wide:
//! - **clear gate**: held for a whole explicit clear or sweep, so no two
//!   dispatch passes read-then-send the same message concurrently
//! - **sweep gate**: sweeps only; sweeps never wait for either gate
//! - **outstanding-count gate**: single-flight count refresh

mod add;
mod builder;
mod clear;
mod config;
mod gate;
mod outstanding;
mod sweep;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use self::builder::MediatorBuilder;
pub use self::config::MediatorConfig;
pub use self::gate::{Gate, GatePermit};
pub use self::sweep::SweepOutcome;

pub(crate) use self::config::millis;
use self::outstanding::OutstandingTracker;
use super::archiver::OutboxArchiver;
use crate::domain::{Args, BatchId, Message, MessageId, RequestContext, Topic};
use crate::error::{OutboxError, OutboxResult};
use crate::ports::{Clock, OutboxAsync, OutboxSync};
use crate::producer::ProducerRegistry;
use crate::resilience::{OutboxCircuitBreaker, RetryError, RetryPolicy};

pub struct OutboxProducerMediator<Tx: Send + Sync + 'static> {
    registry: Arc<ProducerRegistry>,
    retry: RetryPolicy,
    sync_outbox: Option<Arc<dyn OutboxSync<Tx>>>,
    async_outbox: Option<Arc<dyn OutboxAsync<Tx>>>,
    archiver: Option<OutboxArchiver<Tx>>,
    topic_breaker: Option<Arc<dyn OutboxCircuitBreaker>>,
    clock: Arc<dyn Clock>,
    config: MediatorConfig,
    clear_gate: Gate,
    sweep_gate: Gate,
    outstanding: Arc<OutstandingTracker>,
    batches: Mutex<HashMap<BatchId, Vec<Message>>>,
    /// Runtime captured at build time, for work triggered off-runtime.
    runtime: Option<Handle>,
    shut_down: AtomicBool,
}

impl<Tx: Send + Sync + 'static> OutboxProducerMediator<Tx> {
    pub fn builder() -> MediatorBuilder<Tx> {
        MediatorBuilder::new()
    }

    pub fn has_outbox(&self) -> bool {
        self.sync_outbox.is_some()
    }

    pub fn has_async_outbox(&self) -> bool {
        self.async_outbox.is_some()
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProducerRegistry> {
        &self.registry
    }

    /// Last known size of the outstanding set.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.count()
    }

    /// Fail fast when the cached backlog exceeds the configured maximum.
    pub fn check_outbox_outstanding_limit(&self) -> OutboxResult<()> {
        if !self.has_outbox() && !self.has_async_outbox() {
            return Ok(());
        }
        let outstanding = self.outstanding.count();
        debug!(outstanding, "outbox outstanding message count");
        match self.config.max_outstanding_messages {
            Some(limit) if outstanding > limit => {
                Err(OutboxError::LimitReached { outstanding, limit })
            }
            _ => Ok(()),
        }
    }

    /// Recount the outstanding set now and return the new count.
    ///
    /// Waits for a refresh already in flight rather than skipping.
    pub async fn refresh_outstanding_count(&self, ctx: &RequestContext) -> usize {
        let Some(permit) = self.outstanding.enter().await else {
            return self.outstanding.count();
        };
        if let Some(store) = &self.async_outbox {
            self.outstanding
                .refresh_async(store.as_ref(), ctx, &permit)
                .await
        } else if let Some(store) = &self.sync_outbox {
            self.outstanding.refresh_blocking(store.as_ref(), ctx, &permit)
        } else {
            self.outstanding.count()
        }
    }

    /// Blocking form of [`refresh_outstanding_count`](Self::refresh_outstanding_count).
    pub fn refresh_outstanding_count_blocking(&self, ctx: &RequestContext) -> usize {
        let Some(permit) = self.outstanding.enter_blocking() else {
            return self.outstanding.count();
        };
        match &self.sync_outbox {
            Some(store) => self.outstanding.refresh_blocking(store.as_ref(), ctx, &permit),
            None => {
                debug!("no synchronous outbox, outstanding count left as is");
                self.outstanding.count()
            }
        }
    }

    /// Archive dispatched messages older than `min_dispatched_age`.
    pub fn archive(&self, min_dispatched_age: Duration, ctx: &RequestContext) -> OutboxResult<usize> {
        self.archiver()?.archive(min_dispatched_age, ctx)
    }

    pub async fn archive_async(
        &self,
        min_dispatched_age: Duration,
        ctx: &RequestContext,
        cancel: &CancellationToken,
    ) -> OutboxResult<usize> {
        self.archiver()?
            .archive_async(min_dispatched_age, ctx, cancel)
            .await
    }

    /// Close every producer. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down outbox producer mediator");
        self.registry.close_all();
    }

    fn archiver(&self) -> OutboxResult<&OutboxArchiver<Tx>> {
        self.archiver.as_ref().ok_or_else(|| {
            OutboxError::Configuration("no archive provider configured".to_string())
        })
    }

    /// Rate-limited trigger for a background count refresh.
    fn check_outstanding_messages(&self, ctx: &RequestContext) {
        if !self.outstanding.claim_slot() {
            return;
        }
        let runtime = Handle::try_current().ok().or_else(|| self.runtime.clone());
        if let (Some(runtime), Some(store)) = (runtime, self.async_outbox.clone()) {
            let tracker = self.outstanding.clone();
            let ctx = ctx.clone();
            runtime.spawn(async move {
                let Some(permit) = tracker.try_enter() else {
                    debug!("outstanding count refresh already running");
                    return;
                };
                tracker.refresh_async(store.as_ref(), &ctx, &permit).await;
            });
        } else if let Some(store) = self.sync_outbox.clone() {
            let tracker = self.outstanding.clone();
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                let Some(permit) = tracker.try_enter() else {
                    debug!("outstanding count refresh already running");
                    return;
                };
                tracker.refresh_blocking(store.as_ref(), &ctx, &permit);
            });
        }
    }

    /// Log an exhausted retry and schedule a count refresh.
    fn retry_failed<E: fmt::Display>(&self, ctx: &RequestContext, err: &RetryError<E>) {
        error!(error = %err, "exception whilst trying to publish message");
        self.check_outstanding_messages(ctx);
    }

    fn tripped_topics(&self) -> Vec<Topic> {
        self.topic_breaker
            .as_ref()
            .map(|breaker| breaker.tripped_topics())
            .unwrap_or_default()
    }

    fn trip_topic(&self, topic: &Topic) {
        if let Some(breaker) = &self.topic_breaker {
            breaker.trip_topic(topic);
        }
    }

    fn cool_down(&self) {
        if let Some(breaker) = &self.topic_breaker {
            breaker.cool_down();
        }
    }

    fn lock_batches(&self) -> MutexGuard<'_, HashMap<BatchId, Vec<Message>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_dispatched_blocking(
        &self,
        store: &dyn OutboxSync<Tx>,
        id: &MessageId,
        ctx: &RequestContext,
        args: &Args,
    ) {
        let marked = self
            .retry
            .execute(|| store.mark_dispatched(id, ctx, self.clock.now(), args));
        if let Err(err) = marked {
            error!(message_id = %id, error = %err, "sent message but could not mark it dispatched");
            self.check_outstanding_messages(ctx);
        }
    }

    async fn mark_dispatched_async(
        &self,
        store: &dyn OutboxAsync<Tx>,
        id: &MessageId,
        ctx: &RequestContext,
        args: &Args,
    ) {
        let marked = self
            .retry
            .execute_async(|| store.mark_dispatched(id, ctx, self.clock.now(), args))
            .await;
        if let Err(err) = marked {
            error!(message_id = %id, error = %err, "sent message but could not mark it dispatched");
            self.check_outstanding_messages(ctx);
        }
    }
}

impl<Tx: Send + Sync + 'static> fmt::Debug for OutboxProducerMediator<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboxProducerMediator")
            .field("producers", &self.registry.len())
            .field("has_outbox", &self.has_outbox())
            .field("has_async_outbox", &self.has_async_outbox())
            .field("config", &self.config)
            .field("outstanding", &self.outstanding.count())
            .finish()
    }
}

/// Race `work` against `cancel`.
async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = OutboxResult<T>>,
) -> OutboxResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OutboxError::Cancelled),
        result = work => result,
    }
}
