//! postbox-core
//!
//! Transactional outbox for message producers: messages are written to an
//! outbox store inside the caller's transaction, then dispatched to brokers
//! either on demand or by a background sweep.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, entry, context）
//! - **ports**: 抽象化レイヤー（OutboxSync/OutboxAsync, producer capabilities, ArchiveProvider, Clock）
//! - **producer**: producer descriptor と topic registry
//! - **resilience**: retry, circuit breaker, topic breaker
//! - **app**: mediator, builder, sweeper, archiver
//! - **impls**: 実装（InMemoryOutbox など開発・テスト用）

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod producer;
pub mod resilience;

pub use app::{
    MediatorBuilder, MediatorConfig, OutboxProducerMediator, OutboxSweeper, SweepOutcome,
    SweeperOptions,
};
pub use domain::{Message, MessageId, MessageType, RequestContext, Topic};
pub use error::{OutboxError, OutboxResult};
