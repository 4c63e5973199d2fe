use async_trait::async_trait;
use log::{debug, error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use super::{event_caption, remove_temp_file};
use crate::error::{Error, Result};
use crate::frigate::{Event, EventSource};
use crate::messaging::MessageHandler;
use crate::notify::{MediaItem, NotificationSink};
use crate::storage::ClipArchive;

/// Handles queued event ids: waits out the grace period, re-reads the
/// event, and routes the finished clip by size.
pub struct CompletionWorker {
    source: Arc<dyn EventSource>,
    archive: Arc<dyn ClipArchive>,
    sink: Arc<dyn NotificationSink>,
    grace: Duration,
    max_attachment_bytes: u64,
}

impl CompletionWorker {
    pub fn new(
        source: Arc<dyn EventSource>,
        archive: Arc<dyn ClipArchive>,
        sink: Arc<dyn NotificationSink>,
        grace: Duration,
        max_attachment_bytes: u64,
    ) -> Self {
        Self {
            source,
            archive,
            sink,
            grace,
            max_attachment_bytes,
        }
    }

    /// Single completion attempt for one event id.
    ///
    /// `StillInProgress` tells the consumer to drop the delivery
    /// without retry. Transport failures requeue it. Local IO faults
    /// are fatal upstream.
    pub async fn process(&self, event_id: &str) -> Result<()> {
        debug!(
            "completion check for {} after {:?} grace",
            event_id, self.grace
        );
        sleep(self.grace).await;

        let (event, in_progress) = self.source.get_by_id(event_id).await?;
        if in_progress {
            return Err(Error::StillInProgress(event_id.to_string()));
        }
        if !event.has_clip {
            info!(
                "Event {} ended without a clip, keeping the discovery notification only",
                event_id
            );
            return Ok(());
        }

        let clip = self.source.fetch_clip(&event).await?;
        let size = tokio::fs::metadata(&clip)
            .await
            .map_err(|e| Error::LocalIo(format!("Failed to stat {}: {}", clip.display(), e)))?
            .len();

        let routing = if size > self.max_attachment_bytes {
            info!(
                "Clip for {} is {} bytes, archiving to object storage",
                event_id, size
            );
            let source = self.source.clone();
            let archive = self.archive.clone();
            let sink = self.sink.clone();
            let event = event.clone();
            let clip = clip.clone();
            tokio::spawn(async move {
                archive_and_link(source, archive, sink, event, clip).await;
            })
        } else {
            info!(
                "Clip for {} is {} bytes, attaching directly",
                event_id, size
            );
            let sink = self.sink.clone();
            let event = event.clone();
            let clip = clip.clone();
            tokio::spawn(async move {
                attach_clip(sink, event, clip).await;
            })
        };
        // The routing task is joined before the clip file goes away.
        if let Err(e) = routing.await {
            error!("Clip routing task for {} failed: {}", event_id, e);
        }

        remove_temp_file(&clip).await;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for CompletionWorker {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event_id = String::from_utf8_lossy(payload).to_string();
        self.process(&event_id).await
    }
}

/// Upload the clip and follow up with a thumbnail notification carrying
/// the download link. Upload failures skip the notification.
async fn archive_and_link(
    source: Arc<dyn EventSource>,
    archive: Arc<dyn ClipArchive>,
    sink: Arc<dyn NotificationSink>,
    event: Event,
    clip: PathBuf,
) {
    let key = event.clip_object_key();
    let url = match archive.upload(&key, &clip).await {
        Ok(url) => url,
        Err(e) => {
            error!(
                "Archival of {} failed, skipping link notification: {}",
                event.id, e
            );
            return;
        }
    };
    info!("Archived clip for {} as {}", event.id, key);

    let thumbnail = match source.fetch_thumbnail(&event).await {
        Ok(path) => path,
        Err(e) => {
            error!("Thumbnail save failed for {}: {}", event.id, e);
            if e.is_fatal() {
                std::process::exit(1);
            }
            return;
        }
    };

    let caption = format!("Ended \n {}", url);
    if let Err(e) = sink
        .send_media_group(
            &event.camera,
            vec![MediaItem::Photo {
                path: thumbnail.clone(),
                caption,
            }],
        )
        .await
    {
        error!("Link notification failed for {}: {}", event.id, e);
    }
    remove_temp_file(&thumbnail).await;
}

/// Send the clip itself as a video attachment.
async fn attach_clip(sink: Arc<dyn NotificationSink>, event: Event, clip: PathBuf) {
    let caption = event_caption(&event);
    if let Err(e) = sink
        .send_media_group(&event.camera, vec![MediaItem::Video { path: clip, caption }])
        .await
    {
        error!("Clip notification failed for {}: {}", event.id, e);
    }
}
