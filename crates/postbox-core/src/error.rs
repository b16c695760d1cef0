//! Error taxonomy for outbox operations.
//!
//! Caller-initiated operations (add, end batch, explicit clear, archive)
//! surface these. Background sweeps and count refreshes log them instead.

use thiserror::Error;

use crate::domain::{BatchId, MessageId, Topic};
use crate::ports::{ArchiveError, StoreError};

#[derive(Debug, Error)]
pub enum OutboxError {
    /// A required collaborator was missing when the mediator was built.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A write or explicit dispatch exhausted its retry policy.
    #[error("channel failure: {0}")]
    ChannelFailure(String),

    #[error("outbox limit reached: {outstanding} outstanding messages exceeds the limit of {limit}")]
    LimitReached { outstanding: usize, limit: usize },

    #[error("message not found in outbox: id={0}")]
    NotFound(MessageId),

    /// An explicit clear stopped at `id`.
    #[error("could not clear message {id}: {source}")]
    ClearFailed {
        id: MessageId,
        #[source]
        source: Box<OutboxError>,
    },

    #[error("archiving failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("no producer registered for topic={0}")]
    ProducerNotFound(Topic),

    #[error("duplicate producer for topic={0}")]
    DuplicateProducer(Topic),

    #[error("no {capability} message producer defined for topic={topic}")]
    MissingCapability {
        capability: &'static str,
        topic: Topic,
    },

    #[error("unknown batch: {0}")]
    UnknownBatch(BatchId),

    #[error("no synchronous outbox configured")]
    NoOutbox,

    #[error("no asynchronous outbox configured")]
    NoAsyncOutbox,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type OutboxResult<T> = Result<T, OutboxError>;
