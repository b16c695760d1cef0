//! Archive provider port: where dispatched messages go before they are
//! deleted from the outbox.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Message, MessageId};
use crate::ports::StoreError;

#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    #[error("archive provider failed for message {id}: {reason}")]
    Provider { id: MessageId, reason: String },

    #[error("outbox store failed while archiving: {0}")]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait ArchiveProvider: Send + Sync {
    fn archive_message(&self, message: &Message) -> Result<(), ArchiveError>;

    async fn archive_message_async(&self, message: &Message) -> Result<(), ArchiveError> {
        self.archive_message(message)
    }
}
