use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{CompletionWorker, DiscoveryLoop, COMPLETION_GRACE, MAX_ATTACHMENT_BYTES, POLL_INTERVAL};
use crate::dedup::SeenStore;
use crate::error::{Error, Result};
use crate::frigate::{Event, EventSource};
use crate::messaging::{MessageHandler, QueueChannel};
use crate::notify::{MediaItem, NotificationSink};
use crate::storage::ClipArchive;

fn event(id: &str, camera: &str, end_time: Option<f64>, has_clip: bool) -> Event {
    Event {
        id: id.to_string(),
        camera: camera.to_string(),
        label: "person".to_string(),
        start_time: 1700000000.0,
        end_time,
        has_clip,
        has_snapshot: true,
        thumbnail: String::new(),
    }
}

struct FakeSource {
    dir: PathBuf,
    active: Vec<Event>,
    list_fails: bool,
    lookup: HashMap<String, Event>,
    clip_bytes: usize,
    clip_fetches: Mutex<u32>,
}

impl FakeSource {
    fn new(dir: &std::path::Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            active: Vec::new(),
            list_fails: false,
            lookup: HashMap::new(),
            clip_bytes: 0,
            clip_fetches: Mutex::new(0),
        }
    }
}

#[async_trait]
impl EventSource for FakeSource {
    async fn list_active(&self) -> Result<Vec<Event>> {
        if self.list_fails {
            return Err(Error::Transport("poll failed".to_string()));
        }
        Ok(self.active.clone())
    }

    async fn get_by_id(&self, event_id: &str) -> Result<(Event, bool)> {
        let event = self
            .lookup
            .get(event_id)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown event {}", event_id)))?;
        let in_progress = event.is_in_progress();
        Ok((event, in_progress))
    }

    async fn fetch_thumbnail(&self, event: &Event) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}.jpg", event.id));
        tokio::fs::write(&path, b"thumb")
            .await
            .map_err(|e| Error::LocalIo(e.to_string()))?;
        Ok(path)
    }

    async fn fetch_clip(&self, event: &Event) -> Result<PathBuf> {
        *self.clip_fetches.lock().unwrap() += 1;
        let path = self.dir.join(format!("{}.mp4", event.id));
        tokio::fs::write(&path, vec![0u8; self.clip_bytes])
            .await
            .map_err(|e| Error::LocalIo(e.to_string()))?;
        Ok(path)
    }
}

#[derive(Default)]
struct FakeSeen {
    ids: Mutex<HashSet<String>>,
}

#[async_trait]
impl SeenStore for FakeSeen {
    async fn seen(&self, event_id: &str) -> Result<bool> {
        Ok(self.ids.lock().unwrap().contains(event_id))
    }

    async fn mark_seen(&self, event_id: &str) -> Result<()> {
        self.ids.lock().unwrap().insert(event_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeQueue {
    published: Mutex<Vec<String>>,
}

#[async_trait]
impl QueueChannel for FakeQueue {
    async fn publish(&self, payload: &[u8]) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(payload).to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeSink {
    groups: Mutex<Vec<(String, Vec<MediaItem>)>>,
}

#[async_trait]
impl NotificationSink for FakeSink {
    async fn send_status(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn send_media_group(&self, camera: &str, items: Vec<MediaItem>) -> Result<()> {
        self.groups
            .lock()
            .unwrap()
            .push((camera.to_string(), items));
        Ok(())
    }
}

#[derive(Default)]
struct FakeArchive {
    fails: bool,
    keys: Mutex<Vec<String>>,
}

#[async_trait]
impl ClipArchive for FakeArchive {
    async fn upload(&self, key: &str, _file: &std::path::Path) -> Result<String> {
        if self.fails {
            return Err(Error::Storage("upload failed".to_string()));
        }
        self.keys.lock().unwrap().push(key.to_string());
        Ok(format!("https://storage.example/{}", key))
    }
}

#[test]
fn cadence_and_limit_constants() {
    assert_eq!(POLL_INTERVAL, Duration::from_millis(200));
    assert_eq!(COMPLETION_GRACE, Duration::from_secs(60));
    assert_eq!(MAX_ATTACHMENT_BYTES, 51_380_224);
}

#[tokio::test]
async fn first_sighting_marks_enqueues_and_notifies() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::new(dir.path()));
    let seen = Arc::new(FakeSeen::default());
    let queue = Arc::new(FakeQueue::default());
    let sink = Arc::new(FakeSink::default());
    let discovery = DiscoveryLoop::new(
        source.clone(),
        seen.clone(),
        queue.clone(),
        sink.clone(),
        POLL_INTERVAL,
    );

    discovery
        .handle_batch(vec![event("evt-1", "Rua", None, true)])
        .await;

    assert_eq!(*queue.published.lock().unwrap(), vec!["evt-1".to_string()]);
    assert!(seen.ids.lock().unwrap().contains("evt-1"));

    let groups = sink.groups.lock().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].0, "Rua");
    match &groups[0].1[0] {
        MediaItem::Photo { caption, path } => {
            assert_eq!(caption, "Rua Event: person, ID: evt-1");
            assert!(!path.exists());
        }
        other => panic!("expected photo, got {:?}", other),
    }
}

#[tokio::test]
async fn reseen_events_are_suppressed() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::new(dir.path()));
    let seen = Arc::new(FakeSeen::default());
    let queue = Arc::new(FakeQueue::default());
    let sink = Arc::new(FakeSink::default());
    let discovery = DiscoveryLoop::new(
        source.clone(),
        seen.clone(),
        queue.clone(),
        sink.clone(),
        POLL_INTERVAL,
    );

    let batch = vec![event("evt-1", "Rua", None, true)];
    discovery.handle_batch(batch.clone()).await;
    discovery.handle_batch(batch).await;

    assert_eq!(queue.published.lock().unwrap().len(), 1);
    assert_eq!(sink.groups.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn previously_seen_events_do_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::new(dir.path()));
    let seen = Arc::new(FakeSeen::default());
    seen.mark_seen("evt-1").await.unwrap();
    let queue = Arc::new(FakeQueue::default());
    let sink = Arc::new(FakeSink::default());
    let discovery = DiscoveryLoop::new(
        source.clone(),
        seen.clone(),
        queue.clone(),
        sink.clone(),
        POLL_INTERVAL,
    );

    discovery
        .handle_batch(vec![event("evt-1", "Rua", None, true)])
        .await;

    assert!(queue.published.lock().unwrap().is_empty());
    assert!(sink.groups.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_poll_skips_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::new(dir.path());
    source.list_fails = true;
    let sink = Arc::new(FakeSink::default());
    let discovery = DiscoveryLoop::new(
        Arc::new(source),
        Arc::new(FakeSeen::default()),
        Arc::new(FakeQueue::default()),
        sink.clone(),
        POLL_INTERVAL,
    );

    discovery.poll_cycle().await;

    assert_eq!(discovery.in_flight(), 0);
    assert!(sink.groups.lock().unwrap().is_empty());
}

#[tokio::test]
async fn poll_cycle_handles_the_batch_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::new(dir.path());
    source.active = vec![event("evt-1", "Rua", None, true)];
    let sink = Arc::new(FakeSink::default());
    let discovery = DiscoveryLoop::new(
        Arc::new(source),
        Arc::new(FakeSeen::default()),
        Arc::new(FakeQueue::default()),
        sink.clone(),
        POLL_INTERVAL,
    );

    discovery.poll_cycle().await;

    // Wait for the spawned batch task to finish
    for _ in 0..50 {
        if !sink.groups.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.groups.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn completed_small_clip_is_attached_directly() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::new(dir.path());
    source
        .lookup
        .insert("evt-1".to_string(), event("evt-1", "Rua", Some(1700000042.0), true));
    source.clip_bytes = 600;
    let archive = Arc::new(FakeArchive::default());
    let sink = Arc::new(FakeSink::default());
    let worker = CompletionWorker::new(
        Arc::new(source),
        archive.clone(),
        sink.clone(),
        Duration::ZERO,
        1000,
    );

    worker.process("evt-1").await.unwrap();

    assert!(archive.keys.lock().unwrap().is_empty());
    let groups = sink.groups.lock().unwrap();
    assert_eq!(groups.len(), 1);
    match &groups[0].1[0] {
        MediaItem::Video { caption, path } => {
            assert_eq!(caption, "Rua Event: person, ID: evt-1");
            assert!(!path.exists());
        }
        other => panic!("expected video, got {:?}", other),
    }
}

#[tokio::test]
async fn clip_at_the_limit_is_still_attached() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::new(dir.path());
    source
        .lookup
        .insert("evt-1".to_string(), event("evt-1", "Rua", Some(1700000042.0), true));
    source.clip_bytes = 1000;
    let archive = Arc::new(FakeArchive::default());
    let sink = Arc::new(FakeSink::default());
    let worker = CompletionWorker::new(
        Arc::new(source),
        archive.clone(),
        sink.clone(),
        Duration::ZERO,
        1000,
    );

    worker.process("evt-1").await.unwrap();

    assert!(archive.keys.lock().unwrap().is_empty());
    assert!(matches!(
        sink.groups.lock().unwrap()[0].1[0],
        MediaItem::Video { .. }
    ));
}

#[tokio::test]
async fn oversized_clip_is_archived_with_a_link() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::new(dir.path());
    source
        .lookup
        .insert("evt-1".to_string(), event("evt-1", "Rua", Some(1700000042.0), true));
    source.clip_bytes = 1001;
    let archive = Arc::new(FakeArchive::default());
    let sink = Arc::new(FakeSink::default());
    let worker = CompletionWorker::new(
        Arc::new(source),
        archive.clone(),
        sink.clone(),
        Duration::ZERO,
        1000,
    );

    worker.process("evt-1").await.unwrap();

    assert_eq!(
        *archive.keys.lock().unwrap(),
        vec!["Rua/2023-11-14 22:13:20-person.mp4".to_string()]
    );

    let groups = sink.groups.lock().unwrap();
    assert_eq!(groups.len(), 1);
    match &groups[0].1[0] {
        MediaItem::Photo { caption, .. } => assert_eq!(
            caption,
            "Ended \n https://storage.example/Rua/2023-11-14 22:13:20-person.mp4"
        ),
        other => panic!("expected photo, got {:?}", other),
    }

    // Both temp files are gone once processing finishes
    assert!(!dir.path().join("evt-1.mp4").exists());
    assert!(!dir.path().join("evt-1.jpg").exists());
}

#[tokio::test]
async fn still_in_progress_events_are_dropped_without_clip_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::new(dir.path());
    source
        .lookup
        .insert("evt-1".to_string(), event("evt-1", "Rua", None, true));
    let source = Arc::new(source);
    let sink = Arc::new(FakeSink::default());
    let worker = CompletionWorker::new(
        source.clone(),
        Arc::new(FakeArchive::default()),
        sink.clone(),
        Duration::ZERO,
        1000,
    );

    let err = worker.process("evt-1").await.unwrap_err();

    assert!(matches!(err, Error::StillInProgress(_)));
    assert!(!err.is_fatal());
    assert_eq!(*source.clip_fetches.lock().unwrap(), 0);
    assert!(sink.groups.lock().unwrap().is_empty());
}

#[tokio::test]
async fn completed_event_without_clip_keeps_discovery_notification_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::new(dir.path());
    source
        .lookup
        .insert("evt-1".to_string(), event("evt-1", "Rua", Some(1700000042.0), false));
    let source = Arc::new(source);
    let sink = Arc::new(FakeSink::default());
    let worker = CompletionWorker::new(
        source.clone(),
        Arc::new(FakeArchive::default()),
        sink.clone(),
        Duration::ZERO,
        1000,
    );

    worker.process("evt-1").await.unwrap();

    assert_eq!(*source.clip_fetches.lock().unwrap(), 0);
    assert!(sink.groups.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_event_lookup_is_a_retryable_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::new(dir.path()));
    let worker = CompletionWorker::new(
        source,
        Arc::new(FakeArchive::default()),
        Arc::new(FakeSink::default()),
        Duration::ZERO,
        1000,
    );

    let err = worker.process("missing").await.unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn failed_upload_skips_the_link_notification() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::new(dir.path());
    source
        .lookup
        .insert("evt-1".to_string(), event("evt-1", "Rua", Some(1700000042.0), true));
    source.clip_bytes = 1001;
    let archive = Arc::new(FakeArchive {
        fails: true,
        keys: Mutex::new(Vec::new()),
    });
    let sink = Arc::new(FakeSink::default());
    let worker = CompletionWorker::new(
        Arc::new(source),
        archive,
        sink.clone(),
        Duration::ZERO,
        1000,
    );

    worker.process("evt-1").await.unwrap();

    assert!(sink.groups.lock().unwrap().is_empty());
    assert!(!dir.path().join("evt-1.mp4").exists());
}

#[tokio::test]
async fn redelivered_ids_are_processed_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::new(dir.path());
    source
        .lookup
        .insert("evt-1".to_string(), event("evt-1", "Rua", Some(1700000042.0), true));
    source.clip_bytes = 1001;
    let archive = Arc::new(FakeArchive::default());
    let sink = Arc::new(FakeSink::default());
    let worker = CompletionWorker::new(
        Arc::new(source),
        archive.clone(),
        sink.clone(),
        Duration::ZERO,
        1000,
    );

    worker.handle(b"evt-1").await.unwrap();
    worker.handle(b"evt-1").await.unwrap();

    // Same deterministic key both times, so the second run is an overwrite
    assert_eq!(
        *archive.keys.lock().unwrap(),
        vec![
            "Rua/2023-11-14 22:13:20-person.mp4".to_string(),
            "Rua/2023-11-14 22:13:20-person.mp4".to_string(),
        ]
    );
    assert_eq!(sink.groups.lock().unwrap().len(), 2);
}
