//! MediatorBuilder - mediator の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - producer registry, retry policy and at least one outbox are required
//! - anything missing is an `OutboxError::Configuration` from `build()`
//! - confirmation callbacks are wired exactly once, here

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tracing::{error, info, warn};

use super::config::MediatorConfig;
use super::gate::Gate;
use super::outstanding::OutstandingTracker;
use super::OutboxProducerMediator;
use crate::app::archiver::OutboxArchiver;
use crate::domain::{Args, MessageId, RequestContext};
use crate::error::{OutboxError, OutboxResult};
use crate::ports::{
    ArchiveProvider, Clock, OutboxAsync, OutboxSync, PublishCallback, SystemClock,
};
use crate::producer::{Producer, ProducerRegistry};
use crate::resilience::{OutboxCircuitBreaker, RetryPolicy};

/// Builds an [`OutboxProducerMediator`].
///
/// # 使用例
/// ```ignore
/// let mediator = OutboxProducerMediator::builder()
///     .producer_registry(registry)
///     .retry_policy(RetryPolicy::default())
///     .outbox(store.clone())
///     .async_outbox(store)
///     .build()?;
/// ```
pub struct MediatorBuilder<Tx: Send + Sync + 'static> {
    registry: Option<Arc<ProducerRegistry>>,
    retry: Option<RetryPolicy>,
    sync_outbox: Option<Arc<dyn OutboxSync<Tx>>>,
    async_outbox: Option<Arc<dyn OutboxAsync<Tx>>>,
    archive_provider: Option<Arc<dyn ArchiveProvider>>,
    topic_breaker: Option<Arc<dyn OutboxCircuitBreaker>>,
    clock: Option<Arc<dyn Clock>>,
    config: MediatorConfig,
}

impl<Tx: Send + Sync + 'static> MediatorBuilder<Tx> {
    pub fn new() -> Self {
        Self {
            registry: None,
            retry: None,
            sync_outbox: None,
            async_outbox: None,
            archive_provider: None,
            topic_breaker: None,
            clock: None,
            config: MediatorConfig::default(),
        }
    }

    pub fn producer_registry(mut self, registry: impl Into<Arc<ProducerRegistry>>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn outbox(mut self, outbox: Arc<dyn OutboxSync<Tx>>) -> Self {
        self.sync_outbox = Some(outbox);
        self
    }

    pub fn async_outbox(mut self, outbox: Arc<dyn OutboxAsync<Tx>>) -> Self {
        self.async_outbox = Some(outbox);
        self
    }

    pub fn archive_provider(mut self, provider: Arc<dyn ArchiveProvider>) -> Self {
        self.archive_provider = Some(provider);
        self
    }

    pub fn outbox_circuit_breaker(mut self, breaker: Arc<dyn OutboxCircuitBreaker>) -> Self {
        self.topic_breaker = Some(breaker);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: MediatorConfig) -> Self {
        self.config = config;
        self
    }

    /// # 検証
    /// - registry / retry policy / outbox が揃っているか
    /// - 不足があれば `OutboxError::Configuration`
    pub fn build(self) -> OutboxResult<OutboxProducerMediator<Tx>> {
        let registry = self.registry.ok_or_else(|| {
            OutboxError::Configuration("a producer registry is required".to_string())
        })?;
        let retry = self
            .retry
            .ok_or_else(|| OutboxError::Configuration("a retry policy is required".to_string()))?;
        if self.sync_outbox.is_none() && self.async_outbox.is_none() {
            return Err(OutboxError::Configuration(
                "an outbox (sync or async) is required".to_string(),
            ));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let runtime = Handle::try_current().ok();
        let archiver = self.archive_provider.map(|provider| {
            OutboxArchiver::new(
                self.sync_outbox.clone(),
                self.async_outbox.clone(),
                provider,
                self.config.archive_batch_size,
            )
        });
        let outstanding = Arc::new(OutstandingTracker::new(
            clock.clone(),
            self.config.max_outstanding_check_interval,
            self.config.outstanding_args.clone(),
        ));

        let wiring = CallbackWiring {
            retry: retry.clone(),
            clock: clock.clone(),
            sync_outbox: self.sync_outbox.clone(),
            async_outbox: self.async_outbox.clone(),
            runtime: runtime.clone(),
        };
        for producer in registry.producers() {
            wiring.configure(&producer);
        }

        info!(
            producers = registry.len(),
            sync_outbox = self.sync_outbox.is_some(),
            async_outbox = self.async_outbox.is_some(),
            "outbox producer mediator built"
        );

        Ok(OutboxProducerMediator {
            registry,
            retry,
            sync_outbox: self.sync_outbox,
            async_outbox: self.async_outbox,
            archiver,
            topic_breaker: self.topic_breaker,
            clock,
            config: self.config,
            clear_gate: Gate::new("clear"),
            sweep_gate: Gate::new("sweep"),
            outstanding,
            batches: Mutex::new(HashMap::new()),
            runtime,
            shut_down: AtomicBool::new(false),
        })
    }
}

impl<Tx: Send + Sync + 'static> Default for MediatorBuilder<Tx> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a confirmation callback needs to mark a message dispatched.
struct CallbackWiring<Tx: Send + Sync + 'static> {
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    sync_outbox: Option<Arc<dyn OutboxSync<Tx>>>,
    async_outbox: Option<Arc<dyn OutboxAsync<Tx>>>,
    runtime: Option<Handle>,
}

impl<Tx: Send + Sync + 'static> CallbackWiring<Tx> {
    /// One callback per confirming producer: the sync store if there is
    /// one, otherwise the async store. Never both.
    fn configure(&self, producer: &Producer) {
        let Some(confirmation) = producer.confirmation() else {
            return;
        };
        let callback = if let Some(store) = self.sync_outbox.clone() {
            self.sync_callback(store)
        } else if let Some(store) = self.async_outbox.clone() {
            self.async_callback(store)
        } else {
            return;
        };
        confirmation.on_message_published(callback);
        info!(topic = %producer.topic(), "publish confirmation callback configured");
    }

    fn sync_callback(&self, store: Arc<dyn OutboxSync<Tx>>) -> PublishCallback {
        let retry = self.retry.clone();
        let clock = self.clock.clone();
        Arc::new(move |success: bool, id: &MessageId| {
            if !success {
                warn!(message_id = %id, "broker did not confirm message");
                return;
            }
            info!(message_id = %id, "sent message");
            let ctx = RequestContext::new();
            let args = Args::new();
            if let Err(err) = retry.execute(|| store.mark_dispatched(id, &ctx, clock.now(), &args)) {
                error!(message_id = %id, error = %err, "could not mark confirmed message dispatched");
            }
        })
    }

    fn async_callback(&self, store: Arc<dyn OutboxAsync<Tx>>) -> PublishCallback {
        let retry = self.retry.clone();
        let clock = self.clock.clone();
        let captured = self.runtime.clone();
        Arc::new(move |success: bool, id: &MessageId| {
            if !success {
                warn!(message_id = %id, "broker did not confirm message");
                return;
            }
            info!(message_id = %id, "sent message");
            let Some(runtime) = Handle::try_current().ok().or_else(|| captured.clone()) else {
                error!(message_id = %id, "no runtime to mark confirmed message dispatched");
                return;
            };
            let (retry, clock, store, id) = (retry.clone(), clock.clone(), store.clone(), id.clone());
            runtime.spawn(async move {
                let ctx = RequestContext::new();
                let args = Args::new();
                let marked = retry
                    .execute_async(|| store.mark_dispatched(&id, &ctx, clock.now(), &args))
                    .await;
                if let Err(err) = marked {
                    error!(message_id = %id, error = %err, "could not mark confirmed message dispatched");
                }
            });
        })
    }
}
