use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::StreamExt;
use log::debug;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::FrigateConfig;
use crate::error::{Error, Result};
use crate::frigate::event::Event;

/// Where the pipeline gets its events from. A trait seam so the
/// pipeline stages can run against in-memory sources in tests.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events currently in progress, up to the configured limit.
    async fn list_active(&self) -> Result<Vec<Event>>;

    /// Single event by id, plus whether it is still in progress.
    async fn get_by_id(&self, event_id: &str) -> Result<(Event, bool)>;

    /// Decode the inline thumbnail into a temp file named after the event id.
    async fn fetch_thumbnail(&self, event: &Event) -> Result<PathBuf>;

    /// Download the recorded clip into a temp file named after the event id.
    async fn fetch_clip(&self, event: &Event) -> Result<PathBuf>;
}

pub struct FrigateClient {
    client: reqwest::Client,
    base_url: String,
    event_limit: u32,
}

impl FrigateClient {
    pub fn new(config: &FrigateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            event_limit: config.event_limit,
        })
    }

    fn temp_path(event_id: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}.{}", event_id, extension))
    }
}

#[async_trait]
impl EventSource for FrigateClient {
    async fn list_active(&self) -> Result<Vec<Event>> {
        let url = format!(
            "{}/api/events?limit={}&in_progress=1",
            self.base_url, self.event_limit
        );
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "Event list request returned {}",
                status
            )));
        }
        let body = resp.text().await?;
        let events: Vec<Event> = serde_json::from_str(&body)?;
        Ok(events)
    }

    async fn get_by_id(&self, event_id: &str) -> Result<(Event, bool)> {
        let url = format!("{}/api/events/{}", self.base_url, event_id);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "Event {} lookup returned {}",
                event_id, status
            )));
        }
        let body = resp.text().await?;
        let event: Event = serde_json::from_str(&body)?;
        let in_progress = event.is_in_progress();
        Ok((event, in_progress))
    }

    async fn fetch_thumbnail(&self, event: &Event) -> Result<PathBuf> {
        let decoded = STANDARD
            .decode(&event.thumbnail)
            .map_err(|e| Error::LocalIo(format!("Thumbnail decode failed for {}: {}", event.id, e)))?;
        let path = Self::temp_path(&event.id, "jpg");
        tokio::fs::write(&path, &decoded)
            .await
            .map_err(|e| Error::LocalIo(format!("Failed to write {}: {}", path.display(), e)))?;
        debug!("saved thumbnail for {} to {}", event.id, path.display());
        Ok(path)
    }

    async fn fetch_clip(&self, event: &Event) -> Result<PathBuf> {
        let url = format!("{}/api/events/{}/clip.mp4", self.base_url, event.id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::LocalIo(format!("Clip download failed for {}: {}", event.id, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::LocalIo(format!(
                "Clip download for {} returned {}",
                event.id, status
            )));
        }

        let path = Self::temp_path(&event.id, "mp4");
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Error::LocalIo(format!("Failed to create {}: {}", path.display(), e)))?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                Error::LocalIo(format!("Clip download for {} interrupted: {}", event.id, e))
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::LocalIo(format!("Failed to write {}: {}", path.display(), e)))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::LocalIo(format!("Failed to flush {}: {}", path.display(), e)))?;
        debug!("saved clip for {} to {}", event.id, path.display());
        Ok(path)
    }
}
