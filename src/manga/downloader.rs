//! Chapter downloads
//!
//! Each queued chapter is written to `{download_dir}/{provider}_{media}_{chapter id}_{number}`
//! with one file per page and a `registry.json` describing them. A chapter
//! directory without a registry is incomplete.

use anyhow::Context;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::image::decode_config;
use super::queue::{DownloadQueue, QueueItem, RunRequest};
use super::{MangaError, Result};
use crate::db::{QueueRecord, QueueStatus};
use crate::events::{EventSink, MANGA_DOWNLOADER_DOWNLOADING_PROGRESS};
use crate::provider::ChapterPage;
use crate::proxy::ImageProxy;
use crate::utils::{catch_panic, spawn_supervised, write_atomic};

pub const REGISTRY_FILENAME: &str = "registry.json";

const MAX_CONCURRENT_PAGES: usize = 5;

const ESCAPES: [(char, &str); 12] = [
    ('/', "$SLASH$"),
    ('\\', "$BSLASH$"),
    (':', "$COLON$"),
    ('*', "$ASTERISK$"),
    ('?', "$QUESTION$"),
    ('"', "$QUOTE$"),
    ('<', "$LT$"),
    ('>', "$GT$"),
    ('|', "$PIPE$"),
    ('.', "$DOT$"),
    (' ', "$SPACE$"),
    ('_', "$UNDERSCORE$"),
];

/// Identifies one downloaded (or queued) chapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadId {
    pub provider: String,
    pub media_id: i32,
    pub chapter_id: String,
    pub chapter_number: String,
}

impl From<&QueueRecord> for DownloadId {
    fn from(record: &QueueRecord) -> Self {
        Self {
            provider: record.provider.clone(),
            media_id: record.media_id,
            chapter_id: record.chapter_id.clone(),
            chapter_number: record.chapter_number.clone(),
        }
    }
}

/// Replace characters that are unsafe in file names, and `_`, with `$TOKEN$`s.
pub fn escape_chapter_id(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for c in id.chars() {
        match ESCAPES.iter().find(|(from, _)| *from == c) {
            Some((_, token)) => escaped.push_str(token),
            None => escaped.push(c),
        }
    }
    escaped
}

pub fn unescape_chapter_id(escaped: &str) -> String {
    let mut id = String::with_capacity(escaped.len());
    let mut rest = escaped;
    'outer: while let Some(c) = rest.chars().next() {
        if c == '$' {
            for (original, token) in ESCAPES.iter() {
                if let Some(after) = rest.strip_prefix(token) {
                    id.push(*original);
                    rest = after;
                    continue 'outer;
                }
            }
        }
        id.push(c);
        rest = &rest[c.len_utf8()..];
    }
    id
}

pub fn format_chapter_dir_name(id: &DownloadId) -> String {
    format!(
        "{}_{}_{}_{}",
        id.provider,
        id.media_id,
        escape_chapter_id(&id.chapter_id),
        id.chapter_number
    )
}

/// Inverse of [`format_chapter_dir_name`]. Anything but four `_` separated segments is rejected.
pub fn parse_chapter_dir_name(name: &str) -> Option<DownloadId> {
    let parts: Vec<&str> = name.split('_').collect();
    let [provider, media_id, chapter_id, chapter_number] = parts.as_slice() else {
        return None;
    };
    if provider.is_empty() || chapter_id.is_empty() {
        return None;
    }
    Some(DownloadId {
        provider: provider.to_string(),
        media_id: media_id.parse().ok()?,
        chapter_id: unescape_chapter_id(chapter_id),
        chapter_number: chapter_number.to_string(),
    })
}

/// One downloaded page as recorded in `registry.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageInfo {
    pub index: usize,
    pub filename: String,
    pub original_url: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
}

/// Page index to page file
pub type Registry = BTreeMap<usize, PageInfo>;

pub struct ChapterDownloader {
    download_dir: PathBuf,
    proxy: Arc<dyn ImageProxy>,
    queue: Arc<DownloadQueue>,
    events: Arc<dyn EventSink>,
    downloaded_tx: mpsc::UnboundedSender<DownloadId>,
}

impl ChapterDownloader {
    /// The receiver yields every chapter that finished downloading.
    pub fn new(
        download_dir: impl Into<PathBuf>,
        proxy: Arc<dyn ImageProxy>,
        queue: Arc<DownloadQueue>,
        events: Arc<dyn EventSink>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DownloadId>) {
        let (downloaded_tx, downloaded_rx) = mpsc::unbounded_channel();
        let downloader = Arc::new(Self {
            download_dir: download_dir.into(),
            proxy,
            queue,
            events,
            downloaded_tx,
        });
        (downloader, downloaded_rx)
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn chapter_dir(&self, id: &DownloadId) -> PathBuf {
        self.download_dir.join(format_chapter_dir_name(id))
    }

    /// Process queue items one at a time until the queue side goes away.
    pub fn start(self: &Arc<Self>, runs: mpsc::Receiver<RunRequest>) -> tokio::task::JoinHandle<()> {
        let runs = Arc::new(tokio::sync::Mutex::new(runs));
        let this = self.clone();
        spawn_supervised("downloader", move || {
            let this = this.clone();
            let runs = runs.clone();
            async move {
                let mut runs = runs.lock().await;
                while let Some((item, cancel)) = runs.recv().await {
                    this.process(item, cancel).await;
                }
                debug!("downloader: Queue closed, stopping");
            }
        })
    }

    async fn process(&self, mut item: QueueItem, cancel: CancellationToken) {
        info!(
            provider = %item.id.provider,
            media_id = item.id.media_id,
            chapter_id = %item.id.chapter_id,
            pages = item.pages.len(),
            "downloader: Downloading chapter"
        );

        match catch_panic("downloader", self.download(&item, &cancel)).await {
            Some(Ok(())) => {
                info!(chapter_id = %item.id.chapter_id, "downloader: Chapter downloaded");
                if self.downloaded_tx.send(item.id.clone()).is_err() {
                    warn!("downloader: Nobody is listening for finished chapters");
                }
            }
            Some(Err(e)) => {
                error!(chapter_id = %item.id.chapter_id, "downloader: Chapter failed: {}", e);
                item.status = QueueStatus::Errored;
            }
            None => {
                item.status = QueueStatus::Errored;
                let dir = self.chapter_dir(&item.id);
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(dir = %dir.display(), "downloader: Failed to remove partial chapter: {}", e),
                }
            }
        }

        self.queue.has_completed(&item);
    }

    async fn download(&self, item: &QueueItem, cancel: &CancellationToken) -> Result<()> {
        let dir = self.chapter_dir(&item.id);
        let target = dir.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if target.exists() {
                std::fs::remove_dir_all(&target)?;
            }
            std::fs::create_dir_all(&target)
        })
        .await
        .map_err(std::io::Error::other)??;

        let total = item.pages.len();
        let semaphore = Semaphore::new((total / 10).clamp(1, MAX_CONCURRENT_PAGES));
        let registry: Mutex<Registry> = Mutex::new(BTreeMap::new());
        let remaining = AtomicUsize::new(total);

        let tasks = item.pages.iter().map(|page| {
            let (dir, semaphore, registry, remaining) = (&dir, &semaphore, &registry, &remaining);
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if cancel.is_cancelled() {
                    return;
                }
                match self.download_page(dir, page).await {
                    Ok(info) => {
                        registry.lock().insert(page.index, info);
                    }
                    Err(e) => warn!(url = %page.url, "downloader: Failed to download page: {:#}", e),
                }
                let left = remaining.fetch_sub(1, Ordering::SeqCst) - 1;
                self.events.send(
                    MANGA_DOWNLOADER_DOWNLOADING_PROGRESS,
                    serde_json::json!({ "chapterId": item.id.chapter_id, "pagesRemaining": left }),
                );
            }
        });
        join_all(tasks).await;

        let registry = registry.into_inner();
        if item.pages.iter().any(|p| !registry.contains_key(&p.index)) {
            tokio::spawn(async move {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(dir = %dir.display(), "downloader: Failed to remove incomplete chapter: {}", e);
                }
            });
            return Err(MangaError::IncompleteDownload {
                downloaded: registry.len(),
                total,
            });
        }

        let data = serde_json::to_vec_pretty(&registry)?;
        let path = dir.join(REGISTRY_FILENAME);
        tokio::task::spawn_blocking(move || write_atomic(&path, &data))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn download_page(&self, dir: &Path, page: &ChapterPage) -> anyhow::Result<PageInfo> {
        let buf = self.proxy.get_image(&page.url, &page.headers).await?;
        let image = decode_config(&buf).with_context(|| format!("decoding {}", page.url))?;

        let filename = format!("{:02}.{}", page.index + 1, image.format.extension());
        tokio::fs::write(dir.join(&filename), &buf)
            .await
            .with_context(|| format!("writing {}", filename))?;

        Ok(PageInfo {
            index: page.index,
            filename,
            original_url: page.url.clone(),
            size: buf.len() as u64,
            width: image.width,
            height: image.height,
        })
    }

    pub async fn delete_chapter(&self, id: &DownloadId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.chapter_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read a chapter's registry; `None` when the chapter is not fully downloaded.
pub(crate) fn read_registry(dir: &Path) -> Result<Option<Registry>> {
    let bytes = match std::fs::read(dir.join(REGISTRY_FILENAME)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::BroadcastSink;
    use crate::manga::image::fixtures::png;
    use crate::proxy::{ProxyError, Result as ProxyResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Serves a PNG for every URL except those containing "broken" or "panic"
    pub(crate) struct StubProxy {
        pub requests: AtomicUsize,
    }

    impl StubProxy {
        pub(crate) fn new() -> Self {
            Self {
                requests: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageProxy for StubProxy {
        async fn get_image(&self, url: &str, _headers: &HashMap<String, String>) -> ProxyResult<Vec<u8>> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if url.contains("broken") {
                return Err(ProxyError::Status(404, url.to_string()));
            }
            if url.contains("panic") {
                panic!("proxy blew up on {}", url);
            }
            Ok(png(800, 1200))
        }
    }

    pub(crate) fn pages(urls: &[&str]) -> Vec<ChapterPage> {
        urls.iter()
            .enumerate()
            .map(|(i, url)| ChapterPage {
                provider: "stub".to_string(),
                url: url.to_string(),
                index: i,
                ..Default::default()
            })
            .collect()
    }

    fn id(chapter_id: &str) -> DownloadId {
        DownloadId {
            provider: "comick".to_string(),
            media_id: 1234,
            chapter_id: chapter_id.to_string(),
            chapter_number: "13.5".to_string(),
        }
    }

    #[test]
    fn test_escape_round_trip() {
        let raw = r#"a/b\c:d*e?f"g<h>i|j.k l_m"#;
        let escaped = escape_chapter_id(raw);
        assert!(!escaped.contains(['/', '\\', ':', '*', '?', '"', '<', '>', '|', '.', ' ', '_']));
        assert_eq!(unescape_chapter_id(&escaped), raw);
        assert_eq!(unescape_chapter_id("plain$id"), "plain$id");
    }

    #[test]
    fn test_chapter_dir_name() {
        let id = id("chapter_id");
        let name = format_chapter_dir_name(&id);
        assert_eq!(name, "comick_1234_chapter$UNDERSCORE$id_13.5");
        assert_eq!(parse_chapter_dir_name(&name), Some(id));
    }

    #[test]
    fn test_parse_rejects_other_layouts() {
        assert_eq!(parse_chapter_dir_name("comick_1234_chapter"), None);
        assert_eq!(parse_chapter_dir_name("comick_1234_a_b_c"), None);
        assert_eq!(parse_chapter_dir_name("comick_abc_chapter_1"), None);
        assert_eq!(parse_chapter_dir_name("_1_chapter_1"), None);
    }

    #[test]
    fn test_registry_json_keys() {
        let mut registry = Registry::new();
        registry.insert(
            0,
            PageInfo {
                index: 0,
                filename: "01.png".to_string(),
                original_url: "https://img/0".to_string(),
                size: 10,
                width: 1,
                height: 2,
            },
        );
        let json = serde_json::to_value(&registry).unwrap();
        assert_eq!(json["0"]["filename"], "01.png");
        assert_eq!(json["0"]["original_url"], "https://img/0");
    }

    fn harness(dir: &Path) -> (Arc<DownloadQueue>, Arc<ChapterDownloader>, mpsc::UnboundedReceiver<DownloadId>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let events = Arc::new(BroadcastSink::default());
        let (queue, runs) = DownloadQueue::new(db, events.clone(), Duration::ZERO);
        let (downloader, downloaded) =
            ChapterDownloader::new(dir, Arc::new(StubProxy::new()), queue.clone(), events);
        downloader.start(runs);
        (queue, downloader, downloaded)
    }

    #[tokio::test]
    async fn test_download_writes_pages_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, downloader, mut downloaded) = harness(dir.path());

        let urls: Vec<String> = (0..12).map(|i| format!("https://img/{}", i)).collect();
        let urls: Vec<&str> = urls.iter().map(String::as_str).collect();
        queue.add(id("c1"), pages(&urls), false).unwrap();
        queue.run();

        let done = tokio::time::timeout(Duration::from_secs(5), downloaded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done, id("c1"));

        let chapter_dir = downloader.chapter_dir(&done);
        let registry = read_registry(&chapter_dir).unwrap().unwrap();
        assert_eq!(registry.len(), 12);
        assert_eq!(registry[&0].filename, "01.png");
        assert_eq!(registry[&11].filename, "12.png");
        assert_eq!((registry[&3].width, registry[&3].height), (800, 1200));
        assert!(chapter_dir.join("12.png").exists());
    }

    #[tokio::test]
    async fn test_missing_page_errors_chapter() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, downloader, mut downloaded) = harness(dir.path());

        queue
            .add(id("bad"), pages(&["https://img/0", "https://img/broken"]), false)
            .unwrap();
        queue.add(id("good"), pages(&["https://img/0"]), false).unwrap();
        queue.run();

        let done = tokio::time::timeout(Duration::from_secs(5), downloaded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.chapter_id, "good");

        // The finished chapter is reported before it leaves the queue
        let mut items = queue.items().unwrap();
        for _ in 0..50 {
            if items.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            items = queue.items().unwrap();
        }
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].chapter_id, "bad");
        assert_eq!(items[0].status, QueueStatus::Errored);

        // Removal of the incomplete directory is asynchronous
        for _ in 0..50 {
            if !downloader.chapter_dir(&id("bad")).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!downloader.chapter_dir(&id("bad")).exists());
    }

    #[tokio::test]
    async fn test_panicking_chapter_leaves_no_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, downloader, mut downloaded) = harness(dir.path());

        queue
            .add(id("crash"), pages(&["https://img/0", "https://img/panic"]), false)
            .unwrap();
        queue.add(id("good"), pages(&["https://img/0"]), false).unwrap();
        queue.run();

        let done = tokio::time::timeout(Duration::from_secs(5), downloaded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.chapter_id, "good");
        assert!(!downloader.chapter_dir(&id("crash")).exists());

        let items = queue.items().unwrap();
        let crashed = items.iter().find(|r| r.chapter_id == "crash").unwrap();
        assert_eq!(crashed.status, QueueStatus::Errored);
    }
}
