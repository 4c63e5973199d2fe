use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// Detection event as reported by the NVR API. Only the fields the
/// relay acts on are modeled; unknown payload fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub camera: String,
    pub label: String,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub has_clip: bool,
    pub has_snapshot: bool,
    /// Base64 encoded JPEG preview
    #[serde(default)]
    pub thumbnail: String,
}

impl Event {
    /// An event without an end time is still being recorded.
    pub fn is_in_progress(&self) -> bool {
        self.end_time.is_none()
    }

    /// Object key an archived clip is stored under, derived from the
    /// camera name, the UTC start time and the detected label.
    pub fn clip_object_key(&self) -> String {
        let started =
            DateTime::from_timestamp(self.start_time as i64, 0).unwrap_or(DateTime::UNIX_EPOCH);
        format!(
            "{}/{}-{}.mp4",
            self.camera,
            started.format("%Y-%m-%d %H:%M:%S"),
            self.label
        )
    }
}
