//! OutboxSweeper - 定期的な outstanding の掃き出し
//!
//! Calls the mediator's sweep on a fixed interval until cancelled. A sweep
//! that finds another sweep (or an explicit clear) in progress is skipped and
//! the next tick tries again.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::mediator::{OutboxProducerMediator, SweepOutcome, millis};
use crate::domain::{Args, RequestContext};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SweeperOptions {
    #[serde(rename = "interval_ms", deserialize_with = "millis")]
    pub interval: Duration,

    /// Only messages at least this old are swept, leaving fresh ones to
    /// the caller's own explicit clear.
    #[serde(rename = "min_message_age_ms", deserialize_with = "millis")]
    pub min_message_age: Duration,

    pub batch_size: usize,
    pub use_bulk: bool,
    pub args: Args,
}

impl Default for SweeperOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            min_message_age: Duration::from_millis(5000),
            batch_size: 100,
            use_bulk: false,
            args: Args::new(),
        }
    }
}

pub struct OutboxSweeper<Tx: Send + Sync + 'static> {
    mediator: Arc<OutboxProducerMediator<Tx>>,
    options: SweeperOptions,
}

impl<Tx: Send + Sync + 'static> OutboxSweeper<Tx> {
    pub fn new(mediator: Arc<OutboxProducerMediator<Tx>>, options: SweeperOptions) -> Self {
        Self { mediator, options }
    }

    pub fn options(&self) -> &SweeperOptions {
        &self.options
    }

    /// One sweep. Prefers the async store; a sync-only mediator sweeps on
    /// the blocking pool.
    pub async fn sweep(&self, cancel: &CancellationToken) -> SweepOutcome {
        let ctx = RequestContext::new();
        let opts = &self.options;
        if self.mediator.has_async_outbox() {
            return self
                .mediator
                .clear_outstanding_from_outbox_async(
                    opts.batch_size,
                    opts.min_message_age,
                    opts.use_bulk,
                    &ctx,
                    &opts.args,
                    cancel,
                )
                .await;
        }

        let mediator = self.mediator.clone();
        let opts = opts.clone();
        let blocking = tokio::task::spawn_blocking(move || {
            mediator.clear_outstanding_from_outbox(
                opts.batch_size,
                opts.min_message_age,
                opts.use_bulk,
                &ctx,
                &opts.args,
            )
        });
        blocking.await.unwrap_or_else(|err| {
            error!(error = %err, "blocking sweep task failed");
            SweepOutcome::Failed
        })
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.options.interval.as_millis() as u64,
            batch_size = self.options.batch_size,
            use_bulk = self.options.use_bulk,
            "outbox sweeper started"
        );
        let mut ticker = tokio::time::interval(self.options.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.sweep(&cancel).await;
                    debug!(?outcome, "sweep finished");
                }
            }
        }
        info!("outbox sweeper stopped");
    }

    /// Run in the background. Cancelling `cancel` (or calling
    /// [`SweeperHandle::shutdown_and_join`]) stops it after the current sweep.
    pub fn spawn(self, cancel: CancellationToken) -> SweeperHandle {
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        SweeperHandle { cancel, join }
    }
}

/// Background sweeper handle.
pub struct SweeperHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            error!(error = %err, "outbox sweeper task failed");
        }
    }
}
