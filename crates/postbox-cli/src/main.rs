//! postbox demo: deposit messages, let the sweeper dispatch them to an
//! in-memory bus, then archive what was sent.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use postbox_core::impls::{
    InMemoryArchiveProvider, InMemoryMessageProducer, InMemoryOutbox, InMemoryTransaction,
    InternalBus,
};
use postbox_core::producer::{ProducerRegistry, Publication};
use postbox_core::resilience::{InMemoryOutboxCircuitBreaker, RetryPolicy};
use postbox_core::{Message, MessageType, OutboxProducerMediator, OutboxSweeper, RequestContext, Topic};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DemoConfig;

#[derive(Debug, Parser)]
#[command(name = "postbox", about = "Transactional outbox demo over an in-memory bus")]
struct Args {
    /// JSON config file.
    #[arg(long, env = "POSTBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Outstanding backlog limit; negative means unlimited.
    #[arg(long, allow_negative_numbers = true)]
    max_outstanding: Option<i64>,

    /// Messages to deposit.
    #[arg(long, default_value_t = 10)]
    messages: usize,

    #[arg(long)]
    sweep_interval_ms: Option<u64>,

    /// Dispatch through bulk producers.
    #[arg(long)]
    bulk: bool,

    /// Stop after this long even if messages are still outstanding.
    #[arg(long, default_value_t = 5_000)]
    run_for_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = DemoConfig::load(args.config.as_deref())?;
    if let Some(limit) = args.max_outstanding {
        config.mediator.max_outstanding_messages = usize::try_from(limit).ok();
    }
    if let Some(interval) = args.sweep_interval_ms {
        config.sweeper.interval = Duration::from_millis(interval);
    }
    config.sweeper.use_bulk |= args.bulk;
    // demo messages are swept as soon as they land
    config.sweeper.min_message_age = Duration::ZERO;

    let outbox = InMemoryOutbox::new();
    let bus = InternalBus::new();
    let producer = Arc::new(InMemoryMessageProducer::new(bus.clone()));
    let archive = Arc::new(InMemoryArchiveProvider::new());

    let mut registry = ProducerRegistry::default();
    for topic in &config.topics {
        registry.register(producer.descriptor(Publication::new(topic.as_str())))?;
    }

    let mediator = Arc::new(
        OutboxProducerMediator::<InMemoryTransaction>::builder()
            .producer_registry(registry)
            .retry_policy(RetryPolicy::default().with_jitter(0.2))
            .outbox(Arc::new(outbox.clone()))
            .async_outbox(Arc::new(outbox.clone()))
            .archive_provider(archive.clone())
            .outbox_circuit_breaker(Arc::new(InMemoryOutboxCircuitBreaker::default()))
            .config(config.mediator.clone())
            .build()
            .context("building mediator")?,
    );

    let cancel = CancellationToken::new();
    let span = info_span!("postbox.demo", messages = args.messages);
    let ctx = RequestContext::with_span(span);

    // one transaction, one batch: all or nothing
    let tx = InMemoryTransaction::new();
    let batch = mediator.start_batch();
    for n in 0..args.messages {
        let topic = &config.topics[n % config.topics.len()];
        let body = serde_json::json!({ "sequence": n });
        let message = Message::on_topic(topic.as_str(), MessageType::Event, body.to_string());
        mediator
            .add_to_outbox_async(message, &ctx, Some(&tx), Some(batch), &cancel)
            .await?;
    }
    match mediator.end_batch_async(batch, &ctx, Some(&tx), &cancel).await {
        Ok(()) => outbox.commit(&tx),
        Err(err) => {
            tx.rollback();
            return Err(err).context("writing batch");
        }
    }
    info!(deposited = args.messages, "messages committed to outbox");

    let sweeper =
        OutboxSweeper::new(mediator.clone(), config.sweeper.clone()).spawn(cancel.child_token());
    let deadline = tokio::time::sleep(Duration::from_millis(args.run_for_ms));
    tokio::pin!(deadline);
    loop {
        let outstanding = mediator.refresh_outstanding_count(&ctx).await;
        if outstanding == 0 {
            break;
        }
        tokio::select! {
            _ = &mut deadline => {
                warn!(outstanding, "stopping with messages still outstanding");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
    sweeper.shutdown_and_join().await;

    let archived = mediator.archive_async(Duration::ZERO, &ctx, &cancel).await?;
    mediator.shutdown();

    for topic in &config.topics {
        println!("{topic}: {} delivered", bus.count(&Topic::new(topic.as_str())));
    }
    println!("archived: {archived}, left in outbox: {}", outbox.entry_count());
    Ok(())
}
