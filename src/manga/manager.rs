//! Download bookkeeping
//!
//! Keeps the in-memory [`MediaMap`] of downloaded chapters in sync with the
//! download directory and fronts the queue for the API.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::downloader::{parse_chapter_dir_name, ChapterDownloader, DownloadId};
use super::queue::{DownloadQueue, RunRequest};
use super::{
    chapter_bucket, chapter_key, downloaded_chapter_bucket, ChapterContainer, MangaError,
    PageService, Result,
};
use crate::db::{MappingStore, QueueRecord};
use crate::events::{EventSink, REFRESHED_MANGA_DOWNLOAD_DATA};
use crate::filecache::FileCache;
use crate::media::Media;
use crate::provider::manga::parser::clean_chapter;
use crate::provider::manga::{chapter_number, LOCAL_PROVIDER_ID};
use crate::provider::ProviderError;
use crate::proxy::ImageProxy;
use crate::utils::spawn_supervised;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterDownloadInfo {
    pub chapter_id: String,
    pub chapter_number: String,
}

/// Provider ID to chapters
pub type ProviderDownloadMap = HashMap<String, Vec<ChapterDownloadInfo>>;

/// Media ID to downloaded chapters
pub type MediaMap = HashMap<i32, ProviderDownloadMap>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaDownloadData {
    pub downloaded: ProviderDownloadMap,
    pub queued: ProviderDownloadMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadListItem {
    pub media_id: i32,
    /// `None` when the media is no longer in the collection
    pub media: Option<Media>,
    pub download_data: ProviderDownloadMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadChapterOptions {
    pub provider: String,
    pub media_id: i32,
    pub chapter_id: String,
    #[serde(default)]
    pub start_now: bool,
}

type Channels = (mpsc::Receiver<RunRequest>, mpsc::UnboundedReceiver<DownloadId>);

pub struct DownloadManager {
    cache: Arc<FileCache>,
    pages: Arc<PageService>,
    store: Arc<dyn MappingStore>,
    events: Arc<dyn EventSink>,
    queue: Arc<DownloadQueue>,
    downloader: Arc<ChapterDownloader>,
    media_map: RwLock<Arc<MediaMap>>,
    reading_download_dir: AtomicBool,
    channels: Mutex<Option<Channels>>,
}

impl DownloadManager {
    pub fn new(
        cache: Arc<FileCache>,
        pages: Arc<PageService>,
        store: Arc<dyn MappingStore>,
        proxy: Arc<dyn ImageProxy>,
        events: Arc<dyn EventSink>,
        download_dir: impl Into<PathBuf>,
        settle_delay: Duration,
    ) -> Arc<Self> {
        let (queue, runs) = DownloadQueue::new(store.clone(), events.clone(), settle_delay);
        let (downloader, downloaded) =
            ChapterDownloader::new(download_dir, proxy, queue.clone(), events.clone());

        Arc::new(Self {
            cache,
            pages,
            store,
            events,
            queue,
            downloader,
            media_map: RwLock::new(Arc::new(MediaMap::new())),
            reading_download_dir: AtomicBool::new(false),
            channels: Mutex::new(Some((runs, downloaded))),
        })
    }

    /// Start the downloader and the finished-chapter listener. Only the first call has any effect.
    pub fn start(self: &Arc<Self>) {
        let Some((runs, downloaded)) = self.channels.lock().take() else {
            return;
        };

        match self.queue.reset_downloading() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "manga: Re-queued interrupted downloads"),
            Err(e) => error!("manga: Failed to reset interrupted downloads: {}", e),
        }

        self.downloader.start(runs);

        let this = self.clone();
        tokio::spawn(async move { this.hydrate_media_map().await });

        let downloaded = Arc::new(tokio::sync::Mutex::new(downloaded));
        let this = self.clone();
        spawn_supervised("manga", move || {
            let this = this.clone();
            let downloaded = downloaded.clone();
            async move {
                let mut downloaded = downloaded.lock().await;
                while let Some(id) = downloaded.recv().await {
                    this.on_chapter_downloaded(&id).await;
                }
            }
        });
    }

    async fn on_chapter_downloaded(&self, id: &DownloadId) {
        let bucket = chapter_bucket(&id.provider, id.media_id);
        let key = chapter_key(&id.provider, id.media_id);
        match self.cache.get::<ChapterContainer>(&bucket, &key) {
            Ok(Some(container)) => {
                let perm = downloaded_chapter_bucket(&id.provider, id.media_id);
                if let Err(e) = self.cache.set_perm(&perm, &key, &container) {
                    error!(key = %key, "manga: Failed to keep chapter container: {}", e);
                }
            }
            Ok(None) => warn!(key = %key, "manga: No cached chapter container for downloaded chapter"),
            Err(e) => warn!(key = %key, "manga: Unreadable chapter container: {}", e),
        }

        self.hydrate_media_map().await;
        self.events.send(REFRESHED_MANGA_DOWNLOAD_DATA, serde_json::Value::Null);
    }

    /// Rebuild the media map from the download directory. A no-op while a rebuild is running.
    pub async fn hydrate_media_map(&self) {
        if self.reading_download_dir.swap(true, Ordering::SeqCst) {
            debug!("manga: Download directory is already being read");
            return;
        }

        let dir = self.downloader.download_dir().to_path_buf();
        match tokio::task::spawn_blocking(move || scan_media_map(&dir)).await {
            Ok(Ok(map)) => {
                debug!(media = map.len(), "manga: Hydrated media map");
                *self.media_map.write() = Arc::new(map);
            }
            Ok(Err(e)) => error!("manga: Failed to read download directory: {}", e),
            Err(e) => error!("manga: Media map task failed: {}", e),
        }

        self.reading_download_dir.store(false, Ordering::SeqCst);
    }

    pub fn media_map(&self) -> Arc<MediaMap> {
        self.media_map.read().clone()
    }

    /// Queue a chapter whose chapter list is already cached.
    pub async fn download_chapter(&self, opts: &DownloadChapterOptions) -> Result<()> {
        if opts.provider == LOCAL_PROVIDER_ID {
            return Err(ProviderError::NotSupported.into());
        }

        let container: ChapterContainer = self
            .cache
            .get(
                &chapter_bucket(&opts.provider, opts.media_id),
                &chapter_key(&opts.provider, opts.media_id),
            )?
            .ok_or(MangaError::NoChapters)?;
        let chapter = container.chapter(&opts.chapter_id).ok_or(MangaError::ChapterNotFound)?;

        let page_container = self
            .pages
            .get_page_container(&opts.provider, opts.media_id, &opts.chapter_id, false, false)
            .await?;
        if page_container.is_downloaded {
            info!(chapter_id = %opts.chapter_id, "manga: Chapter is already downloaded");
            return Ok(());
        }

        let id = DownloadId {
            provider: opts.provider.clone(),
            media_id: opts.media_id,
            chapter_id: opts.chapter_id.clone(),
            chapter_number: clean_chapter(&chapter.chapter),
        };
        self.queue.add(id, page_container.pages, opts.start_now)
    }

    pub async fn delete_chapter(&self, id: &DownloadId) -> Result<()> {
        self.remove_chapter(id).await?;
        self.forget_orphaned_containers(std::slice::from_ref(id)).await?;
        self.hydrate_media_map().await;
        self.events.send(REFRESHED_MANGA_DOWNLOAD_DATA, serde_json::Value::Null);
        Ok(())
    }

    pub async fn delete_chapters(&self, ids: &[DownloadId]) -> Result<()> {
        for id in ids {
            self.remove_chapter(id).await?;
        }
        self.forget_orphaned_containers(ids).await?;
        self.hydrate_media_map().await;
        self.events.send(REFRESHED_MANGA_DOWNLOAD_DATA, serde_json::Value::Null);
        Ok(())
    }

    async fn remove_chapter(&self, id: &DownloadId) -> Result<()> {
        self.downloader.delete_chapter(id).await?;
        info!(provider = %id.provider, media_id = id.media_id, chapter_id = %id.chapter_id, "manga: Deleted chapter");
        Ok(())
    }

    /// Drop the kept chapter list of every media in `ids` that has no downloaded chapter left.
    async fn forget_orphaned_containers(&self, ids: &[DownloadId]) -> Result<()> {
        let dir = self.downloader.download_dir().to_path_buf();
        let remaining = match tokio::task::spawn_blocking(move || scan_media_map(&dir)).await {
            Ok(Ok(map)) => map,
            Ok(Err(e)) => {
                warn!("manga: Failed to read download directory, keeping chapter lists: {}", e);
                return Ok(());
            }
            Err(e) => {
                warn!("manga: Media map task failed, keeping chapter lists: {}", e);
                return Ok(());
            }
        };

        for id in ids {
            let in_use = remaining
                .get(&id.media_id)
                .and_then(|providers| providers.get(&id.provider))
                .is_some_and(|chapters| !chapters.is_empty());
            if in_use {
                continue;
            }
            self.cache.delete_perm(
                &downloaded_chapter_bucket(&id.provider, id.media_id),
                &chapter_key(&id.provider, id.media_id),
            )?;
            debug!(provider = %id.provider, media_id = id.media_id, "manga: Dropped kept chapter list");
        }
        Ok(())
    }

    /// Every downloaded media, paired with its collection entry when there is one.
    pub fn new_download_list(&self, collection: &[Media]) -> Vec<DownloadListItem> {
        let map = self.media_map();
        let mut list: Vec<DownloadListItem> = map
            .iter()
            .map(|(media_id, data)| DownloadListItem {
                media_id: *media_id,
                media: collection.iter().find(|m| m.id == *media_id).cloned(),
                download_data: data.clone(),
            })
            .collect();
        list.sort_by_key(|item| item.media_id);
        list
    }

    pub async fn get_media_downloads(&self, media_id: i32, use_cached: bool) -> Result<MediaDownloadData> {
        if !use_cached {
            self.hydrate_media_map().await;
        }

        let downloaded = self.media_map().get(&media_id).cloned().unwrap_or_default();
        let mut queued = ProviderDownloadMap::new();
        for record in self.store.queued_chapters(media_id)? {
            queued.entry(record.provider).or_default().push(ChapterDownloadInfo {
                chapter_id: record.chapter_id,
                chapter_number: record.chapter_number,
            });
        }

        Ok(MediaDownloadData { downloaded, queued })
    }

    pub fn get_chapter_download_queue(&self) -> Result<Vec<QueueRecord>> {
        self.queue.items()
    }

    pub fn clear_all_chapter_download_queue(&self) -> Result<usize> {
        self.queue.clear()
    }

    pub fn reset_errored_chapter_download_queue(&self) -> Result<usize> {
        self.queue.reset_errored()
    }

    pub fn run_chapter_download_queue(&self) {
        self.queue.run();
    }

    /// Stop the queue, returning the chapter in flight to `not_started`.
    pub fn stop_chapter_download_queue(&self) -> Result<()> {
        self.queue.reset_downloading()?;
        self.queue.stop();
        Ok(())
    }

    /// The chapter the downloader is working on, if any
    pub fn current_download(&self) -> Option<DownloadId> {
        self.queue.current()
    }

    pub fn is_queue_active(&self) -> bool {
        self.queue.is_active()
    }
}

fn scan_media_map(dir: &std::path::Path) -> std::io::Result<MediaMap> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MediaMap::new()),
        Err(e) => return Err(e),
    };

    let mut map = MediaMap::new();
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.path().is_dir() {
            continue;
        }
        let Some(id) = parse_chapter_dir_name(&entry.file_name().to_string_lossy()) else {
            continue;
        };
        map.entry(id.media_id)
            .or_default()
            .entry(id.provider)
            .or_default()
            .push(ChapterDownloadInfo {
                chapter_id: id.chapter_id,
                chapter_number: id.chapter_number,
            });
    }

    for providers in map.values_mut() {
        for chapters in providers.values_mut() {
            chapters.sort_by(|a, b| {
                chapter_number(&a.chapter_number).total_cmp(&chapter_number(&b.chapter_number))
            });
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::BroadcastSink;
    use crate::manga::chapter::tests::{bank_with, StubManga};
    use crate::manga::downloader::tests::StubProxy;
    use crate::manga::ChapterService;

    struct Fixture {
        _dir: tempfile::TempDir,
        chapters: ChapterService,
        pages: Arc<PageService>,
        manager: Arc<DownloadManager>,
        events: Arc<BroadcastSink>,
        cache: Arc<FileCache>,
        download_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path().join("cache")).unwrap());
        let db = Arc::new(Database::in_memory().unwrap());
        let bank = bank_with("stub", Arc::new(StubManga::new(&["1", "02", "3"], 4)));
        let proxy = Arc::new(StubProxy::new());
        let events = Arc::new(BroadcastSink::default());
        let download_dir = dir.path().join("manga");

        let pages = Arc::new(PageService::new(cache.clone(), bank.clone(), proxy.clone(), &download_dir));
        let manager = DownloadManager::new(
            cache.clone(),
            pages.clone(),
            db.clone(),
            proxy,
            events.clone(),
            &download_dir,
            Duration::ZERO,
        );
        Fixture {
            chapters: ChapterService::new(cache.clone(), bank, db, &download_dir),
            pages,
            manager,
            events,
            cache,
            download_dir,
            _dir: dir,
        }
    }

    fn opts(chapter_id: &str) -> DownloadChapterOptions {
        DownloadChapterOptions {
            provider: "stub".to_string(),
            media_id: 1,
            chapter_id: chapter_id.to_string(),
            start_now: false,
        }
    }

    async fn wait_for_refresh(rx: &mut tokio::sync::broadcast::Receiver<crate::events::Event>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(event) = rx.recv().await {
                    if event.name == REFRESHED_MANGA_DOWNLOAD_DATA {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_download_requires_chapter_list() {
        let f = fixture();
        let err = f.manager.download_chapter(&opts("ch-1")).await.unwrap_err();
        assert!(matches!(err, MangaError::NoChapters));
    }

    #[tokio::test]
    async fn test_download_then_read_offline() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.manager.start();
        f.chapters
            .get_chapter_container("stub", 1, &["Vagabond".to_string()], None)
            .await
            .unwrap();

        f.manager.download_chapter(&opts("ch-02")).await.unwrap();
        let queued = f.manager.get_media_downloads(1, true).await.unwrap();
        assert_eq!(queued.queued["stub"][0].chapter_number, "2");

        f.manager.run_chapter_download_queue();
        wait_for_refresh(&mut rx).await;

        let container = f.pages.get_page_container("stub", 1, "ch-02", false, true).await.unwrap();
        assert!(container.is_downloaded);
        assert_eq!(container.pages.len(), 4);
        for (i, page) in container.pages.iter().enumerate() {
            assert_eq!(page.index, i);
        }
        assert!(f.download_dir.join("stub_1_ch-02_2").is_dir());

        // The chapter list survives the temporary cache
        let kept: Option<ChapterContainer> = f
            .cache
            .get_perm(&downloaded_chapter_bucket("stub", 1), &chapter_key("stub", 1))
            .unwrap();
        assert_eq!(kept.unwrap().chapters.len(), 3);

        let downloads = f.manager.get_media_downloads(1, false).await.unwrap();
        assert_eq!(downloads.downloaded["stub"][0].chapter_id, "ch-02");
        assert!(downloads.queued.is_empty());

        let collection = vec![Media {
            id: 1,
            ..Default::default()
        }];
        let list = f.manager.new_download_list(&collection);
        assert_eq!(list.len(), 1);
        assert!(list[0].media.is_some());
        assert!(f.manager.new_download_list(&[])[0].media.is_none());

        let id = DownloadId {
            provider: "stub".to_string(),
            media_id: 1,
            chapter_id: "ch-02".to_string(),
            chapter_number: "2".to_string(),
        };
        f.manager.delete_chapter(&id).await.unwrap();
        assert!(!f.download_dir.join("stub_1_ch-02_2").exists());
        assert!(f.manager.media_map().is_empty());
        let kept: Option<ChapterContainer> = f
            .cache
            .get_perm(&downloaded_chapter_bucket("stub", 1), &chapter_key("stub", 1))
            .unwrap();
        assert!(kept.is_none());
    }

    #[tokio::test]
    async fn test_delete_keeps_sibling_chapter_list() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.manager.start();
        f.chapters
            .get_chapter_container("stub", 1, &["Vagabond".to_string()], None)
            .await
            .unwrap();

        f.manager.download_chapter(&opts("ch-1")).await.unwrap();
        f.manager.download_chapter(&opts("ch-3")).await.unwrap();
        f.manager.run_chapter_download_queue();
        // One refresh per finished chapter
        wait_for_refresh(&mut rx).await;
        wait_for_refresh(&mut rx).await;
        assert!(f.download_dir.join("stub_1_ch-1_1").is_dir());
        assert!(f.download_dir.join("stub_1_ch-3_3").is_dir());

        let id = |chapter_id: &str, number: &str| DownloadId {
            provider: "stub".to_string(),
            media_id: 1,
            chapter_id: chapter_id.to_string(),
            chapter_number: number.to_string(),
        };
        f.manager.delete_chapter(&id("ch-1", "1")).await.unwrap();

        let kept: Option<ChapterContainer> = f
            .cache
            .get_perm(&downloaded_chapter_bucket("stub", 1), &chapter_key("stub", 1))
            .unwrap();
        assert!(kept.is_some());

        // Only the kept list can resolve the chapter once the temporary entry is gone
        f.cache.remove(chapter_bucket("stub", 1).name()).unwrap();
        let containers = f.chapters.get_downloaded_chapter_containers(&[]).await.unwrap();
        assert_eq!(containers.len(), 1);
        let ids: Vec<&str> = containers[0].chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["ch-3"]);

        f.manager.delete_chapters(&[id("ch-3", "3")]).await.unwrap();
        let kept: Option<ChapterContainer> = f
            .cache
            .get_perm(&downloaded_chapter_bucket("stub", 1), &chapter_key("stub", 1))
            .unwrap();
        assert!(kept.is_none());
    }

    #[tokio::test]
    async fn test_stop_resets_queue() {
        let f = fixture();
        f.chapters
            .get_chapter_container("stub", 1, &["Vagabond".to_string()], None)
            .await
            .unwrap();
        f.manager.download_chapter(&opts("ch-1")).await.unwrap();
        f.manager.download_chapter(&opts("ch-3")).await.unwrap();

        assert_eq!(f.manager.get_chapter_download_queue().unwrap().len(), 2);
        f.manager.stop_chapter_download_queue().unwrap();
        assert!(!f.manager.is_queue_active());
        assert_eq!(f.manager.clear_all_chapter_download_queue().unwrap(), 2);
        assert!(f.manager.get_chapter_download_queue().unwrap().is_empty());
    }

    #[test]
    fn test_scan_media_map() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["comick_1_b_10", "comick_1_a_9", "mangadex_1_x_1", "comick_2_c_1", "junk"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("comick_3_file_1"), b"").unwrap();

        let map = scan_media_map(dir.path()).unwrap();
        assert_eq!(map.len(), 2);
        let numbers: Vec<&str> = map[&1]["comick"].iter().map(|c| c.chapter_number.as_str()).collect();
        assert_eq!(numbers, vec!["9", "10"]);
        assert_eq!(map[&1]["mangadex"].len(), 1);
        assert!(scan_media_map(&dir.path().join("missing")).unwrap().is_empty());
    }
}
