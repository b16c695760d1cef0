//! App - アプリケーション層
//!
//! ports を組み合わせて outbox の仲介ロジックを実装します。
//!
//! # 主要コンポーネント
//! - **OutboxProducerMediator**: 書き込み・配送・掃き出し・アーカイブ
//! - **MediatorBuilder**: mediator の構築とワイヤリング
//! - **OutboxSweeper**: 定期的な outstanding の掃き出し
//! - **OutboxArchiver**: 配送済みメッセージのアーカイブ

pub mod archiver;
pub mod mediator;
pub mod sweeper;

pub use self::archiver::OutboxArchiver;
pub use self::mediator::{
    Gate, GatePermit, MediatorBuilder, MediatorConfig, OutboxProducerMediator, SweepOutcome,
};
pub use self::sweeper::{OutboxSweeper, SweeperHandle, SweeperOptions};
