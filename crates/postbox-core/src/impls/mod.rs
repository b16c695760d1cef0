//! Impls - 実装（開発用・テスト用）
//!
//! In-memory versions of the ports. Real stores and broker clients live in
//! their own crates and implement the same traits.

pub mod inmem_archive;
pub mod inmem_outbox;
pub mod inmem_producer;

pub use self::inmem_archive::InMemoryArchiveProvider;
pub use self::inmem_outbox::{InMemoryOutbox, InMemoryTransaction};
pub use self::inmem_producer::{ConfirmationMode, InMemoryMessageProducer, InternalBus};
