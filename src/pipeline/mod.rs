mod completion;
mod discovery;
#[cfg(test)]
mod tests;

pub use completion::CompletionWorker;
pub use discovery::DiscoveryLoop;

use log::warn;
use std::path::Path;
use std::time::Duration;

use crate::frigate::Event;

/// How often the event source is polled for in-progress events.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grace period between learning about an event and checking whether
/// it completed.
pub const COMPLETION_GRACE: Duration = Duration::from_secs(60);

/// Clips strictly larger than this are archived instead of attached.
pub const MAX_ATTACHMENT_BYTES: u64 = 49 * 1024 * 1024;

/// Caption shared by the discovery and direct clip notifications.
fn event_caption(event: &Event) -> String {
    format!("{} Event: {}, ID: {}", event.camera, event.label, event.id)
}

/// Best effort removal of a per-event temp file.
async fn remove_temp_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to remove temp file {}: {}", path.display(), e);
    }
}
