use anyhow::Result;
use log::{error, info};
use std::sync::Arc;
use tokio_util::task::TaskTracker;

use frigate_relay::config::Config;
use frigate_relay::dedup::RedisSeenStore;
use frigate_relay::frigate::{EventSource, FrigateClient};
use frigate_relay::messaging::EventQueue;
use frigate_relay::notify::{NotificationSink, TelegramNotifier};
use frigate_relay::pipeline::{
    CompletionWorker, DiscoveryLoop, COMPLETION_GRACE, MAX_ATTACHMENT_BYTES, POLL_INTERVAL,
};
use frigate_relay::storage::ArchiveStore;

async fn run_app() -> Result<()> {
    // Initialize logging
    env_logger::init();
    info!("Starting Frigate event relay");

    let config = Config::from_env();
    info!("Configuration loaded");

    // Object storage for clips too large to attach
    let archive = Arc::new(ArchiveStore::connect(&config.storage).await?);
    archive.ensure_bucket().await?;
    info!("Archive bucket {} ready", config.storage.bucket);

    // The startup announcement doubles as the bot connectivity probe
    let notifier = Arc::new(TelegramNotifier::new(&config.telegram));
    notifier
        .send_status(&format!(
            "Starting frigate-relay.\nFrigate URL: {}",
            config.frigate.base_url
        ))
        .await?;

    let source = Arc::new(FrigateClient::new(&config.frigate)?);
    let active = source.list_active().await?;
    info!("Frigate reachable, {} events in progress", active.len());
    for event in &active {
        info!(
            "Active at startup: {} on camera {} ({})",
            event.id, event.camera, event.label
        );
    }

    // Durable queue between discovery and completion handling
    let queue = Arc::new(EventQueue::connect(&config.queue).await?);
    info!("Message queue initialized");

    let seen = Arc::new(RedisSeenStore::connect(&config.cache).await?);
    info!("Seen store initialized");

    let worker = Arc::new(CompletionWorker::new(
        source.clone(),
        archive,
        notifier.clone(),
        COMPLETION_GRACE,
        MAX_ATTACHMENT_BYTES,
    ));
    let consumers = TaskTracker::new();
    queue.consume(&consumers, worker).await?;
    info!("Completion consumer started");

    let discovery = Arc::new(DiscoveryLoop::new(
        source,
        seen,
        queue,
        notifier.clone(),
        POLL_INTERVAL,
    ));
    discovery.clone().start().await?;
    info!("Discovery loop started");

    // Wait for termination signals
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    consumers.close();
    info!(
        "Abandoning {} consumer tasks and {} discovery tasks in flight",
        consumers.len(),
        discovery.in_flight()
    );

    if let Err(e) = notifier.send_status("Stopping frigate-relay.").await {
        error!("Failed to send shutdown status message: {}", e);
    }

    // Allow time for the message to be sent before shutting down
    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;

    Ok(())
}

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = runtime.block_on(run_app()) {
        eprintln!("Application error: {}", e);
        std::process::exit(1);
    }
}
