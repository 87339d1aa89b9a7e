//! Client-facing event fan-out

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

pub const CHAPTER_DOWNLOAD_QUEUE_UPDATED: &str = "chapter-download-queue-updated";
pub const REFRESHED_MANGA_DOWNLOAD_DATA: &str = "refreshed-manga-download-data";
pub const MANGA_DOWNLOADER_DOWNLOADING_PROGRESS: &str = "manga-downloader-downloading-progress";

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub name: String,
    pub payload: serde_json::Value,
}

/// Receives UI-facing events from the core
pub trait EventSink: Send + Sync {
    fn send(&self, name: &str, payload: serde_json::Value);
}

/// Broadcasts events to every subscribed websocket
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn send(&self, name: &str, payload: serde_json::Value) {
        let event = Event {
            name: name.to_string(),
            payload,
        };
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            trace!(event = name, "events: no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast() {
        let sink = BroadcastSink::default();
        sink.send(CHAPTER_DOWNLOAD_QUEUE_UPDATED, json!(null));

        let mut rx = sink.subscribe();
        sink.send(
            MANGA_DOWNLOADER_DOWNLOADING_PROGRESS,
            json!({"chapterId": "1", "pagesRemaining": 3}),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, MANGA_DOWNLOADER_DOWNLOADING_PROGRESS);
        assert_eq!(event.payload["pagesRemaining"], 3);
    }
}
