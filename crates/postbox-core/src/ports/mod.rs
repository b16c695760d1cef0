//! Ports - 抽象化レイヤー
//!
//! Outbox stores, broker producers and archive targets live outside this
//! crate. Each is reached through a trait here; `impls` has in-memory
//! versions for development and tests.

pub mod archive;
pub mod clock;
pub mod outbox;
pub mod producer;

pub use self::archive::{ArchiveError, ArchiveProvider};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::outbox::{OutboxAsync, OutboxSync, StoreError};
pub use self::producer::{
    BulkMessageProducerAsync, CloseProducer, MessageProducerAsync, MessageProducerSync,
    ProducerError, PublishCallback, PublishConfirmation,
};
