//! InMemoryMessageProducer - 開発用の producer
//!
//! # 実装詳細
//! - "sends" by appending to an [`InternalBus`], one queue per topic
//! - implements every producer capability, so one instance can back a
//!   complete [`Producer`] descriptor
//! - publish confirmation is opt-in per instance ([`ConfirmationMode`])

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tracing::debug;

use crate::domain::{Message, MessageId, Topic};
use crate::ports::{
    BulkMessageProducerAsync, CloseProducer, MessageProducerAsync, MessageProducerSync,
    ProducerError, PublishCallback, PublishConfirmation,
};
use crate::producer::{Producer, Publication};

/// Per-topic message queues standing in for a broker.
#[derive(Debug, Clone, Default)]
pub struct InternalBus {
    topics: Arc<Mutex<HashMap<Topic, VecDeque<Message>>>>,
}

impl InternalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, message: Message) {
        self.lock()
            .entry(message.topic().clone())
            .or_default()
            .push_back(message);
    }

    pub fn dequeue(&self, topic: &Topic) -> Option<Message> {
        self.lock().get_mut(topic).and_then(VecDeque::pop_front)
    }

    /// Snapshot of everything waiting on `topic`.
    pub fn stream(&self, topic: &Topic) -> Vec<Message> {
        self.lock()
            .get(topic)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, topic: &Topic) -> usize {
        self.lock().get(topic).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Topic, VecDeque<Message>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmationMode {
    /// No confirmation capability; the mediator marks after sending.
    #[default]
    None,
    /// Confirm inside the send call.
    Immediate,
    /// Hold confirmations until [`InMemoryMessageProducer::confirm_pending`].
    Deferred,
}

pub struct InMemoryMessageProducer {
    bus: InternalBus,
    mode: ConfirmationMode,
    callback: Mutex<Option<PublishCallback>>,
    pending: Mutex<Vec<MessageId>>,
    closed: AtomicBool,
}

impl InMemoryMessageProducer {
    pub fn new(bus: InternalBus) -> Self {
        Self::with_confirmation(bus, ConfirmationMode::None)
    }

    pub fn with_confirmation(bus: InternalBus, mode: ConfirmationMode) -> Self {
        Self {
            bus,
            mode,
            callback: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Descriptor exposing every capability this instance has.
    pub fn descriptor(self: &Arc<Self>, publication: Publication) -> Producer {
        let producer = Producer::new(publication)
            .with_sync(self.clone())
            .with_async(self.clone())
            .with_bulk(self.clone())
            .with_closer(self.clone());
        match self.mode {
            ConfirmationMode::None => producer,
            _ => producer.with_confirmation(self.clone()),
        }
    }

    /// Fire the held confirmations. Returns how many fired.
    pub fn confirm_pending(&self, success: bool) -> usize {
        let pending = std::mem::take(&mut *lock(&self.pending));
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            for id in &pending {
                callback(success, id);
            }
        }
        pending.len()
    }

    pub fn pending_confirmations(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn publish(&self, message: &Message) -> Result<(), ProducerError> {
        if self.is_closed() {
            return Err(ProducerError::Closed);
        }
        self.bus.enqueue(message.clone());
        debug!(message_id = %message.id(), topic = %message.topic(), "published to internal bus");

        match self.mode {
            ConfirmationMode::None => {}
            ConfirmationMode::Immediate => {
                let callback = lock(&self.callback).clone();
                if let Some(callback) = callback {
                    callback(true, message.id());
                }
            }
            ConfirmationMode::Deferred => lock(&self.pending).push(message.id().clone()),
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MessageProducerSync for InMemoryMessageProducer {
    fn send(&self, message: &Message) -> Result<(), ProducerError> {
        self.publish(message)
    }
}

#[async_trait]
impl MessageProducerAsync for InMemoryMessageProducer {
    async fn send_async(&self, message: &Message) -> Result<(), ProducerError> {
        self.publish(message)
    }
}

impl BulkMessageProducerAsync for InMemoryMessageProducer {
    fn send_batch(
        &self,
        messages: Vec<Message>,
    ) -> BoxStream<'static, Result<MessageId, ProducerError>> {
        let results: Vec<_> = messages
            .iter()
            .map(|message| self.publish(message).map(|()| message.id().clone()))
            .collect();
        stream::iter(results).boxed()
    }
}

impl PublishConfirmation for InMemoryMessageProducer {
    fn on_message_published(&self, callback: PublishCallback) {
        *lock(&self.callback) = Some(callback);
    }
}

impl CloseProducer for InMemoryMessageProducer {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
