use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::task::TaskTracker;

use super::{event_caption, remove_temp_file};
use crate::dedup::SeenStore;
use crate::error::Result;
use crate::frigate::{Event, EventSource};
use crate::messaging::QueueChannel;
use crate::notify::{MediaItem, NotificationSink};

/// Polls the event source and runs the first-sighting flow for every
/// event id not seen before: mark it seen, enqueue it for completion
/// handling, and post the thumbnail notification.
#[derive(Clone)]
pub struct DiscoveryLoop {
    source: Arc<dyn EventSource>,
    seen: Arc<dyn SeenStore>,
    queue: Arc<dyn QueueChannel>,
    sink: Arc<dyn NotificationSink>,
    poll_interval: Duration,
    tasks: TaskTracker,
}

impl DiscoveryLoop {
    pub fn new(
        source: Arc<dyn EventSource>,
        seen: Arc<dyn SeenStore>,
        queue: Arc<dyn QueueChannel>,
        sink: Arc<dyn NotificationSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            seen,
            queue,
            sink,
            poll_interval,
            tasks: TaskTracker::new(),
        }
    }

    /// Tasks currently in flight, the poll task included.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Start polling in the background.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        info!(
            "Starting discovery loop with poll interval of {:?}",
            self.poll_interval
        );

        let tracker = self.tasks.clone();
        tracker.spawn(async move {
            let mut interval = interval(self.poll_interval);

            loop {
                interval.tick().await;
                self.poll_cycle().await;
            }
        });

        Ok(())
    }

    /// One poll cycle. Poll failures skip the cycle; a non-empty batch
    /// is handled on its own task so a slow batch never delays polling.
    pub async fn poll_cycle(&self) {
        let events = match self.source.list_active().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Event poll failed, skipping cycle: {}", e);
                return;
            }
        };
        if events.is_empty() {
            return;
        }
        debug!("poll returned {} in-progress events", events.len());

        let me = self.clone();
        self.tasks.spawn(async move {
            me.handle_batch(events).await;
        });
    }

    /// Run the first-sighting flow for each event of a batch. A fatal
    /// local fault terminates the process; any other failure is
    /// contained to its event.
    pub async fn handle_batch(&self, events: Vec<Event>) {
        for event in &events {
            if let Err(e) = self.handle_discovery(event).await {
                if e.is_fatal() {
                    error!(
                        "Unrecoverable local fault during discovery of {}: {}",
                        event.id, e
                    );
                    std::process::exit(1);
                }
                error!("Discovery failed for {}: {}", event.id, e);
            }
        }
    }

    async fn handle_discovery(&self, event: &Event) -> Result<()> {
        match self.seen.seen(&event.id).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            // A cache miss on error means a duplicate notification at
            // worst, never a lost event.
            Err(e) => warn!(
                "Seen lookup failed for {}, treating as unseen: {}",
                event.id, e
            ),
        }

        if let Err(e) = self.seen.mark_seen(&event.id).await {
            warn!("Failed to mark {} as seen: {}", event.id, e);
        }

        if let Err(e) = self.queue.publish(event.id.as_bytes()).await {
            error!(
                "Failed to enqueue {} for completion handling: {}",
                event.id, e
            );
        }

        let thumbnail = self.source.fetch_thumbnail(event).await?;
        let caption = event_caption(event);
        if let Err(e) = self
            .sink
            .send_media_group(
                &event.camera,
                vec![MediaItem::Photo {
                    path: thumbnail.clone(),
                    caption,
                }],
            )
            .await
        {
            error!("Discovery notification failed for {}: {}", event.id, e);
        }
        remove_temp_file(&thumbnail).await;

        info!(
            "Event {} discovered on camera {} ({})",
            event.id, event.camera, event.label
        );
        Ok(())
    }
}
