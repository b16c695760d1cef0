//! Producer capability ports.
//!
//! A broker client implements whichever of these it supports. The registry
//! records which ones are present when the producer is registered, so the
//! mediator branches on `Option`s rather than probing types at dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::domain::{Message, MessageId};

#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected message {id}: {reason}")]
    Rejected { id: MessageId, reason: String },

    #[error("producer is closed")]
    Closed,
}

pub trait MessageProducerSync: Send + Sync {
    fn send(&self, message: &Message) -> Result<(), ProducerError>;
}

#[async_trait]
pub trait MessageProducerAsync: Send + Sync {
    async fn send_async(&self, message: &Message) -> Result<(), ProducerError>;
}

/// Sends many messages at once and streams back per-message results as the
/// broker acknowledges them.
pub trait BulkMessageProducerAsync: Send + Sync {
    fn send_batch(&self, messages: Vec<Message>)
    -> BoxStream<'static, Result<MessageId, ProducerError>>;
}

/// Invoked with `(success, message_id)` when the broker acknowledges or
/// rejects a send.
pub type PublishCallback = Arc<dyn Fn(bool, &MessageId) + Send + Sync>;

/// A producer whose sends are confirmed later, out of band.
pub trait PublishConfirmation: Send + Sync {
    fn on_message_published(&self, callback: PublishCallback);
}

pub trait CloseProducer: Send + Sync {
    fn close(&self);
}
