//! Persistent chapter download queue
//!
//! Items are stored through the [`MappingStore`] and processed strictly in
//! insertion order, one at a time. The downloader receives work over a
//! single-slot channel and reports back with [`DownloadQueue::has_completed`].

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::downloader::DownloadId;
use super::Result;
use crate::db::{MappingStore, QueueRecord, QueueStatus};
use crate::events::{EventSink, CHAPTER_DOWNLOAD_QUEUE_UPDATED};
use crate::provider::ChapterPage;

/// A queue item handed to the downloader, with the token that aborts it
pub(crate) type RunRequest = (QueueItem, CancellationToken);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    #[serde(flatten)]
    pub id: DownloadId,
    #[serde(skip)]
    pub pages: Vec<ChapterPage>,
    pub status: QueueStatus,
}

struct QueueState {
    active: bool,
    current: Option<DownloadId>,
    cancel: CancellationToken,
}

pub struct DownloadQueue {
    store: Arc<dyn MappingStore>,
    events: Arc<dyn EventSink>,
    state: Mutex<QueueState>,
    run_tx: mpsc::Sender<RunRequest>,
    settle_delay: Duration,
}

impl DownloadQueue {
    /// The receiver is the downloader's end of the run channel.
    pub fn new(
        store: Arc<dyn MappingStore>,
        events: Arc<dyn EventSink>,
        settle_delay: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<RunRequest>) {
        let (run_tx, run_rx) = mpsc::channel(1);
        let queue = Arc::new(Self {
            store,
            events,
            state: Mutex::new(QueueState {
                active: false,
                current: None,
                cancel: CancellationToken::new(),
            }),
            run_tx,
            settle_delay,
        });
        (queue, run_rx)
    }

    pub fn add(self: &Arc<Self>, id: DownloadId, pages: Vec<ChapterPage>, start_now: bool) -> Result<()> {
        let mut state = self.state.lock();

        let record = QueueRecord {
            provider: id.provider.clone(),
            media_id: id.media_id,
            chapter_id: id.chapter_id.clone(),
            chapter_number: id.chapter_number.clone(),
            page_data: serde_json::to_string(&pages)?,
            status: QueueStatus::NotStarted,
        };
        self.store.insert_queue_item(&record)?;
        info!(
            provider = %id.provider,
            media_id = id.media_id,
            chapter_id = %id.chapter_id,
            "queue: Added chapter"
        );
        self.notify();

        if start_now && state.active {
            self.run_next(&mut state);
        }
        Ok(())
    }

    pub fn run(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if !state.active {
            info!("queue: Starting");
        }
        state.active = true;
        self.run_next(&mut state);
    }

    /// Stop pumping items and abort the chapter in flight.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.active = false;
        state.cancel.cancel();
        state.cancel = CancellationToken::new();
        info!("queue: Stopped");
        self.notify();
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn current(&self) -> Option<DownloadId> {
        self.state.lock().current.clone()
    }

    /// Called by the downloader once `item` reaches a terminal state.
    pub fn has_completed(self: &Arc<Self>, item: &QueueItem) {
        let mut state = self.state.lock();
        let id = &item.id;

        let outcome = if item.status == QueueStatus::Errored {
            self.store
                .update_queue_item_status(&id.provider, id.media_id, &id.chapter_id, QueueStatus::Errored)
        } else {
            self.store.delete_queue_item(&id.provider, id.media_id, &id.chapter_id)
        };
        if let Err(e) = outcome {
            error!(chapter_id = %id.chapter_id, "queue: Failed to record completion: {:#}", e);
        }

        if state.current.as_ref() == Some(id) {
            state.current = None;
        }
        self.notify();

        if state.active {
            self.run_next(&mut state);
        }
    }

    /// Forget an item that never reached the downloader. With `resume`, a
    /// queue restarted in the meantime moves on to its next item.
    fn release(self: &Arc<Self>, id: &DownloadId, resume: bool) {
        let mut state = self.state.lock();
        if state.current.as_ref() != Some(id) {
            return;
        }
        state.current = None;
        if resume && state.active {
            self.run_next(&mut state);
        }
    }

    fn run_next(self: &Arc<Self>, state: &mut QueueState) {
        if state.current.is_some() || !state.active {
            return;
        }

        loop {
            let record = match self.store.next_queue_item() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!("queue: Nothing left to download");
                    return;
                }
                Err(e) => {
                    error!("queue: Failed to read next item: {:#}", e);
                    return;
                }
            };
            let id = DownloadId::from(&record);

            if let Err(e) = self.store.update_queue_item_status(
                &id.provider,
                id.media_id,
                &id.chapter_id,
                QueueStatus::Downloading,
            ) {
                error!(chapter_id = %id.chapter_id, "queue: Failed to mark item downloading: {:#}", e);
                return;
            }

            let pages: Vec<ChapterPage> = match serde_json::from_str(&record.page_data) {
                Ok(pages) => pages,
                Err(e) => {
                    warn!(chapter_id = %id.chapter_id, "queue: Unreadable page data: {}", e);
                    if let Err(e) = self.store.update_queue_item_status(
                        &id.provider,
                        id.media_id,
                        &id.chapter_id,
                        QueueStatus::Errored,
                    ) {
                        error!("queue: Failed to mark item errored: {:#}", e);
                        return;
                    }
                    continue;
                }
            };

            state.current = Some(id.clone());
            self.notify();

            let item = QueueItem {
                id,
                pages,
                status: QueueStatus::Downloading,
            };
            let cancel = state.cancel.clone();
            let queue = self.clone();
            let delay = self.settle_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if cancel.is_cancelled() {
                    debug!(chapter_id = %item.id.chapter_id, "queue: Dispatch cancelled");
                    queue.release(&item.id, true);
                    return;
                }
                let id = item.id.clone();
                if queue.run_tx.send((item, cancel)).await.is_err() {
                    warn!("queue: Downloader is not running");
                    queue.release(&id, false);
                }
            });
            return;
        }
    }

    pub fn items(&self) -> Result<Vec<QueueRecord>> {
        Ok(self.store.queue_items()?)
    }

    /// Remove every item that is not downloading.
    pub fn clear(&self) -> Result<usize> {
        let _state = self.state.lock();
        let removed = self.store.clear_queue()?;
        self.notify();
        Ok(removed)
    }

    pub fn clear_errored(&self) -> Result<usize> {
        let _state = self.state.lock();
        let removed = self.store.clear_errored()?;
        self.notify();
        Ok(removed)
    }

    /// Put errored items back in line.
    pub fn reset_errored(&self) -> Result<usize> {
        let _state = self.state.lock();
        let mut reset = 0;
        for record in self.store.queue_items()? {
            if record.status == QueueStatus::Errored {
                self.store.update_queue_item_status(
                    &record.provider,
                    record.media_id,
                    &record.chapter_id,
                    QueueStatus::NotStarted,
                )?;
                reset += 1;
            }
        }
        self.notify();
        Ok(reset)
    }

    /// Return interrupted items to `not_started`.
    pub fn reset_downloading(&self) -> Result<usize> {
        let _state = self.state.lock();
        Ok(self.store.reset_downloading_queue_items()?)
    }

    fn notify(&self) {
        self.events.send(CHAPTER_DOWNLOAD_QUEUE_UPDATED, serde_json::Value::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::BroadcastSink;

    fn id(chapter_id: &str) -> DownloadId {
        DownloadId {
            provider: "comick".to_string(),
            media_id: 1,
            chapter_id: chapter_id.to_string(),
            chapter_number: "1".to_string(),
        }
    }

    fn page() -> Vec<ChapterPage> {
        vec![ChapterPage {
            url: "https://img/1".to_string(),
            ..Default::default()
        }]
    }

    fn queue() -> (Arc<DownloadQueue>, mpsc::Receiver<RunRequest>, Arc<Database>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let (queue, runs) = DownloadQueue::new(db.clone(), Arc::new(BroadcastSink::default()), Duration::ZERO);
        (queue, runs, db)
    }

    fn downloading(db: &Database) -> usize {
        db.queue_items()
            .unwrap()
            .iter()
            .filter(|r| r.status == QueueStatus::Downloading)
            .count()
    }

    #[tokio::test]
    async fn test_fifo_one_at_a_time() {
        let (queue, mut runs, db) = queue();
        queue.add(id("a"), page(), false).unwrap();
        queue.add(id("b"), page(), false).unwrap();
        queue.run();

        let (first, _) = runs.recv().await.unwrap();
        assert_eq!(first.id.chapter_id, "a");
        assert_eq!(first.pages.len(), 1);
        assert_eq!(downloading(&db), 1);

        tokio::task::yield_now().await;
        assert!(runs.try_recv().is_err());

        queue.has_completed(&first);
        let (second, _) = runs.recv().await.unwrap();
        assert_eq!(second.id.chapter_id, "b");
        assert_eq!(downloading(&db), 1);
        assert_eq!(db.queue_items().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_errored_item_stays_queued() {
        let (queue, mut runs, db) = queue();
        queue.add(id("a"), page(), false).unwrap();
        queue.run();

        let (mut item, _) = runs.recv().await.unwrap();
        item.status = QueueStatus::Errored;
        queue.has_completed(&item);

        let items = db.queue_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Errored);
        assert!(queue.current().is_none());

        assert_eq!(queue.reset_errored().unwrap(), 1);
        let (retry, _) = runs.recv().await.unwrap();
        assert_eq!(retry.id.chapter_id, "a");
    }

    #[tokio::test]
    async fn test_add_does_not_start_inactive_queue() {
        let (queue, mut runs, _db) = queue();
        queue.add(id("a"), page(), true).unwrap();
        tokio::task::yield_now().await;
        assert!(runs.try_recv().is_err());
        assert!(!queue.is_active());
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight() {
        let (queue, mut runs, _db) = queue();
        queue.add(id("a"), page(), false).unwrap();
        queue.run();

        let (_item, cancel) = runs.recv().await.unwrap();
        assert!(!cancel.is_cancelled());
        queue.stop();
        assert!(cancel.is_cancelled());
        assert!(!queue.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay() {
        let db = Arc::new(Database::in_memory().unwrap());
        let (queue, mut runs) =
            DownloadQueue::new(db, Arc::new(BroadcastSink::default()), Duration::from_secs(5));
        queue.add(id("a"), page(), true).unwrap();

        let start = tokio::time::Instant::now();
        queue.run();
        let (item, _) = runs.recv().await.unwrap();
        assert_eq!(item.id.chapter_id, "a");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_during_settle_delay() {
        let db = Arc::new(Database::in_memory().unwrap());
        let (queue, mut runs) =
            DownloadQueue::new(db.clone(), Arc::new(BroadcastSink::default()), Duration::from_secs(5));
        queue.add(id("a"), page(), false).unwrap();
        queue.add(id("b"), page(), false).unwrap();
        queue.run();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.reset_downloading().unwrap(), 1);
        queue.stop();
        queue.run();

        let (item, cancel) = tokio::time::timeout(Duration::from_secs(60), runs.recv())
            .await
            .expect("restarted queue never dispatched")
            .unwrap();
        assert_eq!(item.id.chapter_id, "a");
        assert!(!cancel.is_cancelled());
        assert_eq!(downloading(&db), 1);

        queue.has_completed(&item);
        let (next, _) = tokio::time::timeout(Duration::from_secs(60), runs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id.chapter_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_queue_drops_pending_dispatch() {
        let db = Arc::new(Database::in_memory().unwrap());
        let (queue, mut runs) =
            DownloadQueue::new(db, Arc::new(BroadcastSink::default()), Duration::from_secs(5));
        queue.add(id("a"), page(), false).unwrap();
        queue.run();

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.stop();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(runs.try_recv().is_err());
        assert!(queue.current().is_none());
    }
}
