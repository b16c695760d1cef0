use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use rstest::rstest;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::domain::{MessageHeader, MessageType, Page};
use crate::impls::{
    ConfirmationMode, InMemoryArchiveProvider, InMemoryMessageProducer, InMemoryOutbox,
    InMemoryTransaction, InternalBus,
};
use crate::ports::{
    BulkMessageProducerAsync, ManualClock, MessageProducerAsync, MessageProducerSync,
    ProducerError, StoreError,
};
use crate::producer::{Producer, Publication};
use crate::resilience::InMemoryOutboxCircuitBreaker;

type Mediator = OutboxProducerMediator<InMemoryTransaction>;

struct DeadBroker;

impl MessageProducerSync for DeadBroker {
    fn send(&self, _message: &Message) -> Result<(), ProducerError> {
        Err(ProducerError::Unavailable("connection refused".into()))
    }
}

#[async_trait::async_trait]
impl MessageProducerAsync for DeadBroker {
    async fn send_async(&self, _message: &Message) -> Result<(), ProducerError> {
        Err(ProducerError::Unavailable("connection refused".into()))
    }
}

/// Async broker that takes a while to acknowledge each send.
#[derive(Default)]
struct SlowBroker {
    sends: AtomicUsize,
}

#[async_trait::async_trait]
impl MessageProducerAsync for SlowBroker {
    async fn send_async(&self, _message: &Message) -> Result<(), ProducerError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

/// Records the topic and size of every bulk send before handing it on.
struct CountingBulk {
    inner: Arc<InMemoryMessageProducer>,
    calls: Mutex<Vec<(Topic, usize)>>,
}

impl CountingBulk {
    fn calls(&self) -> Vec<(Topic, usize)> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }
}

impl BulkMessageProducerAsync for CountingBulk {
    fn send_batch(
        &self,
        messages: Vec<Message>,
    ) -> BoxStream<'static, Result<MessageId, ProducerError>> {
        if let Some(first) = messages.first() {
            self.calls
                .lock()
                .unwrap()
                .push((first.topic().clone(), messages.len()));
        }
        self.inner.send_batch(messages)
    }
}

/// Store whose every call fails.
struct BrokenOutbox;

fn backend_down<T>() -> Result<T, StoreError> {
    Err(StoreError::Backend("database unavailable".into()))
}

impl OutboxSync<InMemoryTransaction> for BrokenOutbox {
    fn add(&self, _: &Message, _: &RequestContext, _: Duration, _: Option<&InMemoryTransaction>) -> Result<(), StoreError> {
        backend_down()
    }

    fn add_batch(&self, _: &[Message], _: &RequestContext, _: Duration, _: Option<&InMemoryTransaction>) -> Result<(), StoreError> {
        backend_down()
    }

    fn get(&self, _: &MessageId, _: &RequestContext, _: &Args) -> Result<Option<Message>, StoreError> {
        backend_down()
    }

    fn mark_dispatched(&self, _: &MessageId, _: &RequestContext, _: DateTime<Utc>, _: &Args) -> Result<(), StoreError> {
        backend_down()
    }

    fn mark_dispatched_many(&self, _: &[MessageId], _: &RequestContext, _: DateTime<Utc>, _: &Args) -> Result<(), StoreError> {
        backend_down()
    }

    fn outstanding_messages(&self, _: Duration, _: &RequestContext, _: Page, _: &[Topic], _: &Args) -> Result<Vec<Message>, StoreError> {
        backend_down()
    }

    fn dispatched_messages(&self, _: Duration, _: &RequestContext, _: Page, _: &Args) -> Result<Vec<Message>, StoreError> {
        backend_down()
    }

    fn delete(&self, _: &[MessageId], _: &RequestContext, _: &Args) -> Result<(), StoreError> {
        backend_down()
    }
}

struct Harness {
    outbox: InMemoryOutbox,
    bus: InternalBus,
    producer: Arc<InMemoryMessageProducer>,
    bulk: Arc<CountingBulk>,
    slow: Arc<SlowBroker>,
    clock: ManualClock,
    archive: Arc<InMemoryArchiveProvider>,
    mediator: Mediator,
    ctx: RequestContext,
    args: Args,
}

impl Harness {
    fn new() -> Self {
        Self::build(ConfirmationMode::None, MediatorConfig::default())
    }

    fn with_confirmation(mode: ConfirmationMode) -> Self {
        Self::build(mode, MediatorConfig::default())
    }

    fn with_config(config: MediatorConfig) -> Self {
        Self::build(ConfirmationMode::None, config)
    }

    /// "orders" and "audit" go to the in-memory bus, "broken" to a dead
    /// broker, "sync-only" to a producer without async capabilities and
    /// "slow" to a broker that sleeps on every send.
    fn build(mode: ConfirmationMode, config: MediatorConfig) -> Self {
        let clock = ManualClock::default();
        let outbox = InMemoryOutbox::with_clock(Arc::new(clock.clone()));
        let bus = InternalBus::new();
        let producer = Arc::new(InMemoryMessageProducer::with_confirmation(bus.clone(), mode));
        let archive = Arc::new(InMemoryArchiveProvider::new());

        let bulk = Arc::new(CountingBulk {
            inner: producer.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let slow = Arc::new(SlowBroker::default());

        let mut registry = ProducerRegistry::default();
        for topic in ["orders", "audit"] {
            registry
                .register(
                    producer
                        .descriptor(Publication::new(topic))
                        .with_bulk(bulk.clone()),
                )
                .unwrap();
        }
        registry
            .register(Producer::new(Publication::new("slow")).with_async(slow.clone()))
            .unwrap();
        let dead = Arc::new(DeadBroker);
        registry
            .register(
                Producer::new(Publication::new("broken"))
                    .with_sync(dead.clone())
                    .with_async(dead),
            )
            .unwrap();
        registry
            .register(Producer::new(Publication::new("sync-only")).with_sync(producer.clone()))
            .unwrap();

        let mediator = Mediator::builder()
            .producer_registry(registry)
            .retry_policy(RetryPolicy::new(2, Duration::from_millis(1)))
            .outbox(Arc::new(outbox.clone()))
            .async_outbox(Arc::new(outbox.clone()))
            .archive_provider(archive.clone())
            .outbox_circuit_breaker(Arc::new(InMemoryOutboxCircuitBreaker::default()))
            .clock(Arc::new(clock.clone()))
            .config(config)
            .build()
            .unwrap();

        Self {
            outbox,
            bus,
            producer,
            bulk,
            slow,
            clock,
            archive,
            mediator,
            ctx: RequestContext::new(),
            args: Args::new(),
        }
    }

    fn deposit(&self, topic: &str) -> Message {
        let message = Message::on_topic(topic, MessageType::Event, "{}");
        self.mediator
            .add_to_outbox(message.clone(), &self.ctx, None, None)
            .unwrap();
        message
    }

    fn is_dispatched(&self, message: &Message) -> bool {
        self.outbox
            .entry(message.id())
            .is_some_and(|entry| entry.dispatched_time.is_some())
    }

    fn sweep(&self, amount: usize) -> SweepOutcome {
        self.mediator
            .clear_outstanding_from_outbox(amount, Duration::ZERO, false, &self.ctx, &self.args)
    }

    async fn sweep_async(&self, amount: usize, use_bulk: bool) -> SweepOutcome {
        self.mediator
            .clear_outstanding_from_outbox_async(
                amount,
                Duration::ZERO,
                use_bulk,
                &self.ctx,
                &self.args,
                &CancellationToken::new(),
            )
            .await
    }
}

fn swept(found: usize, dispatched: usize, failed: usize) -> SweepOutcome {
    SweepOutcome::Swept {
        found,
        dispatched,
        failed,
    }
}

#[test]
fn deposit_then_sweep_dispatches_and_marks() {
    let h = Harness::new();
    let message = h.deposit("orders");

    assert!(!h.is_dispatched(&message));
    assert_eq!(h.bus.count(&Topic::new("orders")), 0);

    assert_eq!(h.sweep(10), swept(1, 1, 0));

    assert!(h.is_dispatched(&message));
    assert_eq!(h.bus.dequeue(&Topic::new("orders")).unwrap().id(), message.id());
    assert_eq!(h.sweep(10), swept(0, 0, 0));
}

#[test]
fn cleared_message_leaves_outstanding_set() {
    let h = Harness::with_config(
        serde_json::from_str(r#"{"max_outstanding_messages": -1}"#).unwrap(),
    );
    let message = h.deposit("orders");
    let outstanding = || {
        OutboxSync::<InMemoryTransaction>::outstanding_messages(
            &h.outbox,
            Duration::ZERO,
            &h.ctx,
            Page::default(),
            &[],
            &h.args,
        )
        .unwrap()
    };
    assert_eq!(outstanding(), vec![message.clone()]);

    h.mediator
        .clear_outbox(&[message.id().clone()], &h.ctx, &h.args)
        .unwrap();

    assert_eq!(h.bus.stream(&Topic::new("orders")), vec![message]);
    assert!(outstanding().is_empty());
}

#[test]
fn explicit_clear_dispatches_in_order() {
    let h = Harness::new();
    let first = h.deposit("orders");
    let second = h.deposit("orders");
    let untouched = h.deposit("orders");

    h.mediator
        .clear_outbox(
            &[second.id().clone(), first.id().clone()],
            &h.ctx,
            &h.args,
        )
        .unwrap();

    let orders = Topic::new("orders");
    assert_eq!(h.bus.dequeue(&orders).unwrap().id(), second.id());
    assert_eq!(h.bus.dequeue(&orders).unwrap().id(), first.id());
    assert!(h.bus.dequeue(&orders).is_none());
    assert!(h.is_dispatched(&first));
    assert!(!h.is_dispatched(&untouched));
}

#[test]
fn clearing_unknown_id_is_not_found_and_releases_gate() {
    let h = Harness::new();
    let message = h.deposit("orders");

    let err = h
        .mediator
        .clear_outbox(&[MessageId::new("unknown-id")], &h.ctx, &h.args)
        .unwrap_err();
    assert!(matches!(err, OutboxError::NotFound(id) if id.as_str() == "unknown-id"));

    h.mediator
        .clear_outbox(&[message.id().clone()], &h.ctx, &h.args)
        .unwrap();
    assert!(h.is_dispatched(&message));
}

#[rstest]
#[case(MessageType::None)]
#[case(MessageType::Unacceptable)]
fn clearing_undispatchable_message_is_not_found(#[case] message_type: MessageType) {
    let h = Harness::new();
    let untyped = Message::new(
        MessageHeader::new(MessageId::generate(), Topic::new("orders"), message_type),
        "{}",
    );
    h.mediator
        .add_to_outbox(untyped.clone(), &h.ctx, None, None)
        .unwrap();

    let err = h
        .mediator
        .clear_outbox(&[untyped.id().clone()], &h.ctx, &h.args)
        .unwrap_err();

    assert!(matches!(err, OutboxError::NotFound(_)));
    assert_eq!(h.bus.count(&Topic::new("orders")), 0);
}

#[test]
fn clear_stops_at_first_failure() {
    let h = Harness::new();
    let doomed = h.deposit("broken");
    let after = h.deposit("orders");

    let err = h
        .mediator
        .clear_outbox(&[doomed.id().clone(), after.id().clone()], &h.ctx, &h.args)
        .unwrap_err();

    assert!(matches!(err, OutboxError::ChannelFailure(_)));
    assert!(!h.is_dispatched(&doomed));
    assert!(!h.is_dispatched(&after));
}

#[test]
fn clearing_message_without_producer_names_the_id() {
    let h = Harness::new();
    let orphan = h.deposit("nowhere");
    let after = h.deposit("orders");

    let err = h
        .mediator
        .clear_outbox(&[orphan.id().clone(), after.id().clone()], &h.ctx, &h.args)
        .unwrap_err();

    assert!(err.to_string().contains(orphan.id().as_str()));
    match err {
        OutboxError::ClearFailed { id, source } => {
            assert_eq!(&id, orphan.id());
            assert!(matches!(*source, OutboxError::ProducerNotFound(ref topic) if topic.as_str() == "nowhere"));
        }
        other => panic!("expected ClearFailed, got {other:?}"),
    }
    assert!(!h.is_dispatched(&after));
}

#[test]
fn clearing_through_topic_without_sync_producer_names_the_id() {
    let h = Harness::new();
    let message = h.deposit("slow");

    let err = h
        .mediator
        .clear_outbox(&[message.id().clone()], &h.ctx, &h.args)
        .unwrap_err();

    assert!(matches!(
        err,
        OutboxError::ClearFailed { ref id, ref source }
            if id == message.id() && matches!(**source, OutboxError::MissingCapability { .. })
    ));
}

#[test]
fn outstanding_query_is_exact_and_read_only() {
    let h = Harness::new();
    let pending = h.deposit("orders");
    let sent = h.deposit("orders");
    h.mediator
        .clear_outbox(&[sent.id().clone()], &h.ctx, &h.args)
        .unwrap();

    let read = |min_age| {
        OutboxSync::<InMemoryTransaction>::outstanding_messages(
            &h.outbox,
            min_age,
            &h.ctx,
            Page::default(),
            &[],
            &h.args,
        )
        .unwrap()
    };

    let first = read(Duration::ZERO);
    let second = read(Duration::ZERO);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id(), pending.id());
    assert_eq!(first, second);
    assert!(read(Duration::from_secs(5)).is_empty());
}

#[test]
fn deferred_confirmation_marks_only_when_confirmed() {
    let h = Harness::with_confirmation(ConfirmationMode::Deferred);
    let message = h.deposit("orders");

    assert_eq!(h.sweep(10), swept(1, 1, 0));
    assert!(!h.is_dispatched(&message));
    assert_eq!(h.producer.pending_confirmations(), 1);

    assert_eq!(h.producer.confirm_pending(true), 1);
    assert!(h.is_dispatched(&message));
}

#[test]
fn rejected_confirmation_leaves_message_outstanding() {
    let h = Harness::with_confirmation(ConfirmationMode::Deferred);
    let message = h.deposit("orders");
    h.sweep(10);

    h.producer.confirm_pending(false);

    assert!(!h.is_dispatched(&message));
    assert_eq!(h.sweep(10), swept(1, 1, 0));
}

#[test]
fn immediate_confirmation_marks_through_callback() {
    let h = Harness::with_confirmation(ConfirmationMode::Immediate);
    let message = h.deposit("orders");

    h.mediator
        .clear_outbox(&[message.id().clone()], &h.ctx, &h.args)
        .unwrap();

    assert!(h.is_dispatched(&message));
}

#[test]
fn concurrent_sweep_is_skipped() {
    let h = Harness::new();
    let message = h.deposit("orders");

    let held = h.mediator.sweep_gate.try_enter().unwrap();
    assert_eq!(h.sweep(10), SweepOutcome::Skipped);
    drop(held);

    let held = h.mediator.clear_gate.try_enter().unwrap();
    assert_eq!(h.sweep(10), SweepOutcome::Skipped);
    assert!(!h.is_dispatched(&message));
    drop(held);

    assert_eq!(h.sweep(10), swept(1, 1, 0));
}

#[test]
fn skipped_sweep_leaves_held_gate_alone() {
    let h = Harness::new();
    let _sweep = h.mediator.sweep_gate.try_enter().unwrap();

    h.sweep(10);

    assert!(h.mediator.clear_gate.try_enter().is_some());
    assert!(h.mediator.sweep_gate.is_busy());
}

#[test]
fn failed_topic_is_tripped_for_the_next_sweep() {
    let h = Harness::new();
    h.deposit("broken");
    let order = h.deposit("orders");

    assert_eq!(h.sweep(10), swept(2, 1, 1));
    assert!(h.is_dispatched(&order));

    let later = h.deposit("orders");
    assert_eq!(h.sweep(10), swept(1, 1, 0));
    assert!(h.is_dispatched(&later));

    // cooled down: the broken message is offered again
    assert_eq!(h.sweep(10), swept(1, 0, 1));
}

#[test]
fn sweep_respects_amount_and_oldest_first() {
    let h = Harness::new();
    let oldest = h.deposit("orders");
    h.clock.advance(Duration::from_millis(10));
    let newest = h.deposit("orders");

    assert_eq!(h.sweep(1), swept(1, 1, 0));

    assert!(h.is_dispatched(&oldest));
    assert!(!h.is_dispatched(&newest));
}

#[test]
fn sweep_without_readable_store_fails() {
    let registry = ProducerRegistry::default();
    let mediator = Mediator::builder()
        .producer_registry(registry)
        .retry_policy(RetryPolicy::no_retry())
        .outbox(Arc::new(BrokenOutbox))
        .build()
        .unwrap();

    let outcome = mediator.clear_outstanding_from_outbox(
        10,
        Duration::ZERO,
        false,
        &RequestContext::new(),
        &Args::new(),
    );

    assert_eq!(outcome, SweepOutcome::Failed);
}

#[test]
fn failed_write_is_a_channel_failure() {
    let mediator = Mediator::builder()
        .producer_registry(ProducerRegistry::default())
        .retry_policy(RetryPolicy::new(3, Duration::from_millis(1)))
        .outbox(Arc::new(BrokenOutbox))
        .build()
        .unwrap();

    let err = mediator
        .add_to_outbox(
            Message::on_topic("orders", MessageType::Event, "{}"),
            &RequestContext::new(),
            None,
            None,
        )
        .unwrap_err();

    assert!(matches!(err, OutboxError::ChannelFailure(reason) if reason.contains("database unavailable")));
}

#[test]
fn limit_blocks_writes_until_drained() {
    let h = Harness::with_config(MediatorConfig {
        max_outstanding_messages: Some(2),
        ..MediatorConfig::default()
    });
    for _ in 0..3 {
        h.deposit("orders");
    }
    assert_eq!(h.mediator.refresh_outstanding_count_blocking(&h.ctx), 3);

    let blocked = Message::on_topic("orders", MessageType::Event, "{}");
    let err = h
        .mediator
        .add_to_outbox(blocked.clone(), &h.ctx, None, None)
        .unwrap_err();
    assert!(matches!(
        err,
        OutboxError::LimitReached {
            outstanding: 3,
            limit: 2
        }
    ));
    assert!(h.outbox.entry(blocked.id()).is_none());

    h.sweep(10);
    assert_eq!(h.mediator.refresh_outstanding_count_blocking(&h.ctx), 0);
    h.mediator
        .add_to_outbox(blocked, &h.ctx, None, None)
        .unwrap();
}

#[test]
fn write_joins_caller_transaction() {
    let h = Harness::new();
    let tx = InMemoryTransaction::new();
    let message = Message::on_topic("orders", MessageType::Event, "{}");

    h.mediator
        .add_to_outbox(message.clone(), &h.ctx, Some(&tx), None)
        .unwrap();
    assert!(h.outbox.entry(message.id()).is_none());
    assert_eq!(h.sweep(10), swept(0, 0, 0));

    h.outbox.commit(&tx);
    assert_eq!(h.sweep(10), swept(1, 1, 0));
}

#[test]
fn batch_is_written_on_end() {
    let h = Harness::new();
    let batch = h.mediator.start_batch();
    for _ in 0..3 {
        h.mediator
            .add_to_outbox(
                Message::on_topic("orders", MessageType::Event, "{}"),
                &h.ctx,
                None,
                Some(batch),
            )
            .unwrap();
    }
    assert_eq!(h.outbox.entry_count(), 0);

    h.mediator.end_batch(batch, &h.ctx, None).unwrap();

    assert_eq!(h.outbox.entry_count(), 3);
    assert!(matches!(
        h.mediator.end_batch(batch, &h.ctx, None),
        Err(OutboxError::UnknownBatch(id)) if id == batch
    ));
}

#[test]
fn unknown_batch_is_rejected() {
    let h = Harness::new();
    let err = h
        .mediator
        .add_to_outbox(
            Message::on_topic("orders", MessageType::Event, "{}"),
            &h.ctx,
            None,
            Some(BatchId::generate()),
        )
        .unwrap_err();

    assert!(matches!(err, OutboxError::UnknownBatch(_)));
}

#[test]
fn archive_moves_aged_dispatched_messages() {
    let h = Harness::new();
    let sent = h.deposit("orders");
    let pending = h.deposit("broken");
    h.sweep(10);
    h.clock.advance(Duration::from_secs(120));

    let archived = h.mediator.archive(Duration::from_secs(60), &h.ctx).unwrap();

    assert_eq!(archived, 1);
    assert_eq!(h.archive.archived()[0].id(), sent.id());
    assert!(h.outbox.entry(sent.id()).is_none());
    assert!(h.outbox.entry(pending.id()).is_some());
}

#[test]
fn archive_without_provider_is_configuration_error() {
    let mediator = Mediator::builder()
        .producer_registry(ProducerRegistry::default())
        .retry_policy(RetryPolicy::default())
        .outbox(Arc::new(InMemoryOutbox::new()))
        .build()
        .unwrap();

    let err = mediator
        .archive(Duration::ZERO, &RequestContext::new())
        .unwrap_err();

    assert!(matches!(err, OutboxError::Configuration(_)));
}

#[test]
fn build_requires_registry_retry_and_outbox() {
    let missing_registry = Mediator::builder()
        .retry_policy(RetryPolicy::default())
        .outbox(Arc::new(InMemoryOutbox::new()))
        .build();
    let missing_retry = Mediator::builder()
        .producer_registry(ProducerRegistry::default())
        .outbox(Arc::new(InMemoryOutbox::new()))
        .build();
    let missing_outbox = Mediator::builder()
        .producer_registry(ProducerRegistry::default())
        .retry_policy(RetryPolicy::default())
        .build();

    for result in [missing_registry, missing_retry, missing_outbox] {
        assert!(matches!(result, Err(OutboxError::Configuration(_))));
    }
}

#[test]
fn shutdown_closes_producers_once() {
    let h = Harness::new();
    h.mediator.shutdown();
    h.mediator.shutdown();

    assert!(h.producer.is_closed());
    assert!(h.mediator.registry().producers().iter().all(|p| p.is_closed()));
}

#[tokio::test]
async fn async_deposit_and_sweep() {
    let h = Harness::new();
    let message = Message::on_topic("orders", MessageType::Command, "{}");
    h.mediator
        .add_to_outbox_async(message.clone(), &h.ctx, None, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.sweep_async(10, false).await, swept(1, 1, 0));
    assert!(h.is_dispatched(&message));
}

#[tokio::test]
async fn async_sweep_needs_async_capability() {
    let h = Harness::new();
    h.deposit("sync-only");

    assert_eq!(h.sweep_async(10, false).await, swept(1, 0, 1));
}

#[tokio::test]
async fn bulk_sweep_groups_by_topic() {
    let h = Harness::new();
    let orders: Vec<Message> = (0..3).map(|_| h.deposit("orders")).collect();
    h.deposit("sync-only");

    assert_eq!(h.sweep_async(10, true).await, swept(4, 3, 1));

    assert!(orders.iter().all(|message| h.is_dispatched(message)));
    assert_eq!(h.bus.count(&Topic::new("orders")), 3);
}

#[tokio::test]
async fn bulk_sweep_sends_one_batch_per_topic() {
    let h = Harness::new();
    for topic in ["orders", "audit", "orders", "audit", "orders"] {
        h.deposit(topic);
    }

    assert_eq!(h.sweep_async(10, true).await, swept(5, 5, 0));

    assert_eq!(
        h.bulk.calls(),
        vec![(Topic::new("audit"), 2), (Topic::new("orders"), 3)]
    );
    assert_eq!(h.sweep_async(10, true).await, swept(0, 0, 0));
    assert_eq!(h.bulk.calls().len(), 2);
}

#[tokio::test]
async fn racing_async_sweeps_dispatch_once() {
    let h = Harness::new();
    let message = h.deposit("slow");

    let (first, second) = tokio::join!(h.sweep_async(10, false), h.sweep_async(10, false));

    let mut outcomes = [first, second];
    outcomes.sort_by_key(|outcome| matches!(outcome, SweepOutcome::Skipped));
    assert_eq!(outcomes, [swept(1, 1, 0), SweepOutcome::Skipped]);
    assert_eq!(h.slow.sends.load(Ordering::SeqCst), 1);
    assert!(h.is_dispatched(&message));
}

#[tokio::test]
async fn async_clear_failure_names_the_id() {
    let h = Harness::new();
    let message = h.deposit("sync-only");

    let err = h
        .mediator
        .clear_outbox_async(&[message.id().clone()], &h.ctx, &h.args, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OutboxError::ClearFailed { ref id, .. } if id == message.id()));
    assert!(!h.is_dispatched(&message));
}

#[tokio::test]
async fn async_clear_and_batch() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    let batch = h.mediator.start_batch();
    let message = Message::on_topic("orders", MessageType::Event, "{}");
    h.mediator
        .add_to_outbox_async(message.clone(), &h.ctx, None, Some(batch), &cancel)
        .await
        .unwrap();
    h.mediator
        .end_batch_async(batch, &h.ctx, None, &cancel)
        .await
        .unwrap();

    h.mediator
        .clear_outbox_async(&[message.id().clone()], &h.ctx, &h.args, &cancel)
        .await
        .unwrap();

    assert!(h.is_dispatched(&message));
}

#[tokio::test]
async fn async_limit_uses_refreshed_count() {
    let h = Harness::with_config(MediatorConfig {
        max_outstanding_messages: Some(0),
        ..MediatorConfig::default()
    });
    h.deposit("orders");
    assert_eq!(h.mediator.refresh_outstanding_count(&h.ctx).await, 1);

    let blocked = Message::on_topic("orders", MessageType::Event, "{}");
    let err = h
        .mediator
        .add_to_outbox_async(blocked.clone(), &h.ctx, None, None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OutboxError::LimitReached { .. }));
    assert!(h.outbox.entry(blocked.id()).is_none());
    assert_eq!(h.outbox.entry_count(), 1);
}

#[tokio::test]
async fn elapsed_interval_refreshes_count_in_background() {
    let h = Harness::with_config(MediatorConfig {
        max_outstanding_messages: Some(0),
        ..MediatorConfig::default()
    });
    h.deposit("orders");
    assert_eq!(h.mediator.outstanding_count(), 0);

    h.clock.advance(Duration::from_secs(2));
    h.deposit("orders");

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.mediator.outstanding_count() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.mediator.outstanding_count(), 2);

    let blocked = Message::on_topic("orders", MessageType::Event, "{}");
    let err = h
        .mediator
        .add_to_outbox(blocked.clone(), &h.ctx, None, None)
        .unwrap_err();
    assert!(matches!(err, OutboxError::LimitReached { outstanding: 2, limit: 0 }));
    assert!(h.outbox.entry(blocked.id()).is_none());
}

#[tokio::test]
async fn cancelled_work_stops_early() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let message = Message::on_topic("orders", MessageType::Event, "{}");

    let err = h
        .mediator
        .add_to_outbox_async(message.clone(), &h.ctx, None, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::Cancelled));
    assert!(h.outbox.entry(message.id()).is_none());

    h.deposit("orders");
    let outcome = h
        .mediator
        .clear_outstanding_from_outbox_async(10, Duration::ZERO, false, &h.ctx, &h.args, &cancel)
        .await;
    assert_eq!(outcome, SweepOutcome::Failed);
    assert!(!h.mediator.sweep_gate.is_busy());
}

#[tokio::test]
async fn async_archive_via_mediator() {
    let h = Harness::new();
    h.deposit("orders");
    h.sweep(10);
    h.clock.advance(Duration::from_secs(10));

    let archived = h
        .mediator
        .archive_async(Duration::ZERO, &h.ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(archived, 1);
    assert_eq!(h.archive.len(), 1);
}
