//! Chapter lists

use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::downloader::{parse_chapter_dir_name, DownloadId};
use super::{
    chapter_bucket, chapter_key, downloaded_chapter_bucket, is_media_bucket,
    parse_chapter_bucket_name, ChapterContainer, Result,
};
use crate::db::MappingStore;
use crate::extension::ExtensionBank;
use crate::filecache::FileCache;
use crate::media::Media;
use crate::provider::manga::sort_chapters;
use crate::provider::{ProviderError, SearchOptions, SearchResult};
use crate::resolver::comparison::normalize;
use crate::resolver::{hydrate_search_ratings, TitleResolver};

const SEARCH_CACHE_CAPACITY: usize = 64;

/// Highest known chapter of one scanlator/language pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatestChapterNumber {
    pub provider: String,
    pub scanlator: String,
    pub language: String,
    pub number: f64,
}

pub struct ChapterService {
    cache: Arc<FileCache>,
    bank: Arc<ExtensionBank>,
    mappings: Arc<dyn MappingStore>,
    resolver: TitleResolver,
    download_dir: PathBuf,
    search_cache: Mutex<LruCache<String, Vec<SearchResult>>>,
}

impl ChapterService {
    pub fn new(
        cache: Arc<FileCache>,
        bank: Arc<ExtensionBank>,
        mappings: Arc<dyn MappingStore>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        let capacity = NonZeroUsize::new(SEARCH_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache,
            bank,
            resolver: TitleResolver::new(mappings.clone()),
            mappings,
            download_dir: download_dir.into(),
            search_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Chapter list of `media_id` on `provider`, from cache or freshly fetched.
    pub async fn get_chapter_container(
        &self,
        provider: &str,
        media_id: i32,
        titles: &[String],
        year: Option<i32>,
    ) -> Result<ChapterContainer> {
        if let Some(container) = self.cached_container(provider, media_id) {
            debug!(provider, media_id, "manga: Chapter container cache HIT");
            return Ok(container);
        }

        let source = self.bank.get_manga(provider)?;
        let manga_id = self
            .resolver
            .resolve_manga_id(provider, source.as_ref(), media_id, titles, year)
            .await?;

        let mut chapters = match source.find_chapters(&manga_id).await {
            Ok(chapters) => chapters,
            Err(ProviderError::NoChapters) => Vec::new(),
            Err(e) => {
                warn!(provider, media_id, manga_id = %manga_id, "manga: Failed to fetch chapters: {}", e);
                return Err(e.into());
            }
        };
        for chapter in &mut chapters {
            chapter.provider = provider.to_string();
        }
        sort_chapters(&mut chapters);

        let container = ChapterContainer {
            media_id,
            provider: provider.to_string(),
            chapters,
        };

        // Stored even when empty so an explicit refresh is needed to retry
        if let Err(e) =
            self.cache
                .set(&chapter_bucket(provider, media_id), &chapter_key(provider, media_id), &container)
        {
            warn!(provider, media_id, "manga: Failed to populate chapter cache: {}", e);
        }

        info!(
            provider,
            media_id,
            chapters = container.chapters.len(),
            "manga: Fetched chapter container"
        );
        Ok(container)
    }

    /// Temporary cache entry, with unreadable entries treated as absent
    pub(crate) fn cached_container(&self, provider: &str, media_id: i32) -> Option<ChapterContainer> {
        let bucket = chapter_bucket(provider, media_id);
        match self.cache.get(&bucket, &chapter_key(provider, media_id)) {
            Ok(container) => container,
            Err(e) => {
                warn!(provider, media_id, "manga: Ignoring unreadable chapter cache: {}", e);
                None
            }
        }
    }

    fn downloaded_container(&self, provider: &str, media_id: i32) -> Option<ChapterContainer> {
        let bucket = downloaded_chapter_bucket(provider, media_id);
        match self.cache.get_perm(&bucket, &chapter_key(provider, media_id)) {
            Ok(container) => container,
            Err(e) => {
                warn!(provider, media_id, "manga: Ignoring unreadable downloaded chapter cache: {}", e);
                None
            }
        }
    }

    /// Chapter containers limited to the chapters present in the download directory.
    pub async fn get_downloaded_chapter_containers(&self, collection: &[Media]) -> Result<Vec<ChapterContainer>> {
        let mut downloaded: HashMap<(String, i32), HashSet<String>> = HashMap::new();
        for id in self.scan_download_dir()? {
            downloaded
                .entry((id.provider, id.media_id))
                .or_default()
                .insert(id.chapter_id);
        }

        let mut containers = Vec::with_capacity(downloaded.len());
        for ((provider, media_id), chapter_ids) in downloaded {
            let container = match self
                .downloaded_container(&provider, media_id)
                .or_else(|| self.cached_container(&provider, media_id))
            {
                Some(container) => container,
                None => {
                    let Some(media) = collection.iter().find(|m| m.id == media_id) else {
                        debug!(provider = %provider, media_id, "manga: No container for downloaded chapters");
                        continue;
                    };
                    match self
                        .get_chapter_container(&provider, media_id, &media.titles, media.start_year)
                        .await
                    {
                        Ok(container) => container,
                        Err(e) => {
                            warn!(provider = %provider, media_id, "manga: Failed to rebuild chapter container: {}", e);
                            continue;
                        }
                    }
                }
            };

            let chapters = container
                .chapters
                .into_iter()
                .filter(|c| chapter_ids.contains(&c.id))
                .collect();
            containers.push(ChapterContainer {
                media_id,
                provider,
                chapters,
            });
        }

        containers.sort_by(|a, b| (a.media_id, &a.provider).cmp(&(b.media_id, &b.provider)));
        Ok(containers)
    }

    fn scan_download_dir(&self) -> Result<Vec<DownloadId>> {
        let entries = match std::fs::read_dir(&self.download_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| parse_chapter_dir_name(&e.file_name().to_string_lossy()))
            .collect())
    }

    /// Point `media_id` at `manga_id` on `provider`.
    pub fn manual_mapping(&self, provider: &str, media_id: i32, manga_id: &str) -> Result<()> {
        // Cache goes first so no reader sees the old list under the new mapping
        self.cache.remove(chapter_bucket(provider, media_id).name())?;
        self.mappings.set_manga_mapping(provider, media_id, manga_id)?;
        info!(provider, media_id, manga_id, "manga: Saved manual mapping");
        Ok(())
    }

    pub fn get_manga_mapping(&self, provider: &str, media_id: i32) -> Result<Option<String>> {
        Ok(self.mappings.manga_mapping(provider, media_id)?)
    }

    pub fn delete_manga_mapping(&self, provider: &str, media_id: i32) -> Result<()> {
        self.cache.remove(chapter_bucket(provider, media_id).name())?;
        self.mappings.delete_manga_mapping(provider, media_id)?;
        Ok(())
    }

    /// Search `provider` directly, remembering results per normalized query.
    pub async fn manual_search(&self, provider: &str, query: &str) -> Result<Vec<SearchResult>> {
        let key = format!("{}${}", provider, normalize(query));
        if let Some(results) = self.search_cache.lock().get(&key) {
            debug!(provider, query, "manga: Search cache HIT");
            return Ok(results.clone());
        }

        let source = self.bank.get_manga(provider)?;
        let mut results = source.search(&SearchOptions::new(query)).await?;
        for result in &mut results {
            result.provider = provider.to_string();
        }
        hydrate_search_ratings(&mut results, query);

        self.search_cache.lock().put(key, results.clone());
        Ok(results)
    }

    /// Drop and re-fetch the chapter lists of the provider selected for each media.
    pub async fn refresh_chapter_containers(
        &self,
        collection: &[Media],
        selected: &HashMap<i32, String>,
    ) -> Result<()> {
        let targets: Vec<(&Media, &String)> = selected
            .iter()
            .filter_map(|(media_id, provider)| {
                collection.iter().find(|m| m.id == *media_id).map(|m| (m, provider))
            })
            .collect();

        for (media, provider) in &targets {
            self.cache.remove(chapter_bucket(provider, media.id).name())?;
        }

        let refreshes = targets.iter().map(|(media, provider)| async move {
            let outcome = self
                .get_chapter_container(provider, media.id, &media.titles, media.start_year)
                .await;
            (media.id, provider, outcome)
        });
        for (media_id, provider, outcome) in join_all(refreshes).await {
            if let Err(e) = outcome {
                warn!(provider = %provider, media_id, "manga: Failed to refresh chapter container: {}", e);
            }
        }

        info!(count = targets.len(), "manga: Refreshed chapter containers");
        Ok(())
    }

    /// Floor of the highest cached chapter, per media and per scanlator/language.
    pub fn get_latest_chapter_numbers_map(&self) -> Result<HashMap<i32, Vec<LatestChapterNumber>>> {
        let mut map: HashMap<i32, Vec<LatestChapterNumber>> = HashMap::new();

        for name in self.cache.bucket_names()? {
            let Some((provider, media_id)) = parse_chapter_bucket_name(&name) else {
                continue;
            };
            let Some(container) = self.cached_container(&provider, media_id) else {
                continue;
            };

            let mut groups: HashMap<(String, String), (u32, f64)> = HashMap::new();
            for chapter in &container.chapters {
                let Ok(number) = chapter.chapter.trim().parse::<f64>() else {
                    continue;
                };
                let group = (
                    chapter.scanlator.clone().unwrap_or_default(),
                    chapter.language.clone().unwrap_or_default(),
                );
                let entry = groups.entry(group).or_insert((chapter.index, number));
                if chapter.index > entry.0 {
                    *entry = (chapter.index, number);
                }
            }

            let latest = map.entry(media_id).or_default();
            let mut numbers: Vec<LatestChapterNumber> = groups
                .into_iter()
                .map(|((scanlator, language), (_, number))| LatestChapterNumber {
                    provider: provider.clone(),
                    scanlator,
                    language,
                    number: number.floor(),
                })
                .collect();
            numbers.sort_by(|a, b| (&a.scanlator, &a.language).cmp(&(&b.scanlator, &b.language)));
            latest.extend(numbers);
        }

        Ok(map)
    }

    /// Remove every temporary manga bucket of `media_id`.
    pub fn empty_manga_cache(&self, media_id: i32) -> Result<usize> {
        let removed = self.cache.remove_all_by(|name| is_media_bucket(name, media_id))?;
        debug!(media_id, removed, "manga: Emptied manga cache");
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Database;
    use crate::extension::{ExtensionManifest, ProviderHandle};
    use crate::manga::MangaError;
    use crate::provider::{
        ChapterDetails, ChapterPage, MangaProvider, MangaProviderSettings, ProviderKind,
        Result as ProviderResult,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves one manga per ID with a fixed chapter list
    pub(crate) struct StubManga {
        pub chapters: Vec<ChapterDetails>,
        pub pages: Vec<ChapterPage>,
        pub searches: AtomicUsize,
        pub fetched: Mutex<Vec<String>>,
    }

    impl StubManga {
        pub(crate) fn new(chapters: &[&str], pages: usize) -> Self {
            Self {
                chapters: chapters
                    .iter()
                    .map(|c| ChapterDetails {
                        provider: "upstream".to_string(),
                        id: format!("ch-{}", c),
                        chapter: c.to_string(),
                        title: format!("Chapter {}", c),
                        ..Default::default()
                    })
                    .collect(),
                pages: (0..pages)
                    .map(|i| ChapterPage {
                        provider: "upstream".to_string(),
                        url: format!("https://img.example/{}.png", i),
                        index: pages - 1 - i,
                        ..Default::default()
                    })
                    .collect(),
                searches: AtomicUsize::new(0),
                fetched: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MangaProvider for StubManga {
        async fn search(&self, opts: &SearchOptions) -> ProviderResult<Vec<SearchResult>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![SearchResult {
                provider: "upstream".to_string(),
                id: format!("id-{}", opts.query.to_lowercase().replace(' ', "-")),
                title: opts.query.clone(),
                ..Default::default()
            }])
        }

        async fn find_chapters(&self, manga_id: &str) -> ProviderResult<Vec<ChapterDetails>> {
            self.fetched.lock().push(manga_id.to_string());
            Ok(self.chapters.clone())
        }

        async fn find_chapter_pages(&self, _chapter_id: &str) -> ProviderResult<Vec<ChapterPage>> {
            Ok(self.pages.clone())
        }

        fn settings(&self) -> MangaProviderSettings {
            MangaProviderSettings::default()
        }
    }

    pub(crate) fn bank_with(id: &str, provider: Arc<StubManga>) -> Arc<ExtensionBank> {
        let bank = Arc::new(ExtensionBank::new());
        let manifest = ExtensionManifest::builtin(id, id, ProviderKind::Manga, "");
        bank.register(manifest, ProviderHandle::Manga(provider)).unwrap();
        bank
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: Arc<FileCache>,
        db: Arc<Database>,
        provider: Arc<StubManga>,
        service: ChapterService,
        download_dir: PathBuf,
    }

    fn fixture(chapters: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path().join("cache")).unwrap());
        let db = Arc::new(Database::in_memory().unwrap());
        let provider = Arc::new(StubManga::new(chapters, 0));
        let download_dir = dir.path().join("manga");
        let service = ChapterService::new(
            cache.clone(),
            bank_with("stub", provider.clone()),
            db.clone(),
            &download_dir,
        );
        Fixture {
            _dir: dir,
            cache,
            db,
            provider,
            service,
            download_dir,
        }
    }

    fn titles() -> Vec<String> {
        vec!["One Piece".to_string()]
    }

    #[tokio::test]
    async fn test_chapter_container_sorted_and_cached() {
        let f = fixture(&["10", "2", "1.5", "1"]);

        let container = f.service.get_chapter_container("stub", 1, &titles(), None).await.unwrap();
        let labels: Vec<&str> = container.chapters.iter().map(|c| c.chapter.as_str()).collect();
        assert_eq!(labels, vec!["1", "1.5", "2", "10"]);
        for (i, chapter) in container.chapters.iter().enumerate() {
            assert_eq!(chapter.index as usize, i);
            assert_eq!(chapter.provider, "stub");
        }

        f.service.get_chapter_container("stub", 1, &titles(), None).await.unwrap();
        assert_eq!(f.provider.fetched.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_container_is_cached() {
        let f = fixture(&[]);
        let container = f.service.get_chapter_container("stub", 1, &titles(), None).await.unwrap();
        assert!(container.chapters.is_empty());
        assert!(f.service.cached_container("stub", 1).is_some());
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_returns_chapters() {
        let f = fixture(&["1", "2"]);
        // A file where the bucket directory should be makes every write fail
        std::fs::write(f.cache.root().join("manga_stub_chapters_1"), b"").unwrap();

        let container = f.service.get_chapter_container("stub", 1, &titles(), None).await.unwrap();
        assert_eq!(container.chapters.len(), 2);
        assert!(f.service.cached_container("stub", 1).is_none());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let f = fixture(&["1"]);
        let err = f.service.get_chapter_container("missing", 1, &titles(), None).await.unwrap_err();
        assert!(matches!(err, MangaError::ProviderNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_manual_mapping_invalidates_and_refetches() {
        let f = fixture(&["1", "2"]);
        f.db.set_manga_mapping("stub", 1, "old-id").unwrap();
        f.service.get_chapter_container("stub", 1, &titles(), None).await.unwrap();

        f.service.manual_mapping("stub", 1, "new-id").unwrap();
        assert!(f.service.cached_container("stub", 1).is_none());
        assert!(!f.cache.root().join("manga_stub_chapters_1").exists());

        f.service.get_chapter_container("stub", 1, &titles(), None).await.unwrap();
        assert_eq!(*f.provider.fetched.lock(), vec!["old-id", "new-id"]);
        assert_eq!(f.service.get_manga_mapping("stub", 1).unwrap().as_deref(), Some("new-id"));
    }

    #[tokio::test]
    async fn test_manual_search_is_cached() {
        let f = fixture(&["1"]);
        let first = f.service.manual_search("stub", "One Piece").await.unwrap();
        let second = f.service.manual_search("stub", "  one piece ").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].provider, "stub");
        assert_eq!(first[0].rating, 1.0);
        assert_eq!(f.provider.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_downloaded_containers_filter_to_disk() {
        let f = fixture(&["1", "2", "3"]);
        f.service.get_chapter_container("stub", 1, &titles(), None).await.unwrap();

        std::fs::create_dir_all(f.download_dir.join("stub_1_ch-2_2")).unwrap();
        std::fs::create_dir_all(f.download_dir.join("not-a-chapter")).unwrap();

        let containers = f.service.get_downloaded_chapter_containers(&[]).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].chapters.len(), 1);
        assert_eq!(containers[0].chapters[0].id, "ch-2");
    }

    #[tokio::test]
    async fn test_downloaded_containers_rebuild_from_collection() {
        let f = fixture(&["1", "2"]);
        std::fs::create_dir_all(f.download_dir.join("stub_5_ch-1_1")).unwrap();
        std::fs::create_dir_all(f.download_dir.join("stub_6_ch-1_1")).unwrap();

        let collection = vec![Media {
            id: 5,
            titles: titles(),
            ..Default::default()
        }];
        let containers = f.service.get_downloaded_chapter_containers(&collection).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].media_id, 5);
    }

    #[tokio::test]
    async fn test_refresh_and_latest_numbers() {
        let f = fixture(&["1", "2", "12.5"]);
        f.service.get_chapter_container("stub", 1, &titles(), None).await.unwrap();

        let collection = vec![Media {
            id: 1,
            titles: titles(),
            ..Default::default()
        }];
        let selected = HashMap::from([(1, "stub".to_string())]);
        f.service.refresh_chapter_containers(&collection, &selected).await.unwrap();
        assert_eq!(f.provider.fetched.lock().len(), 2);

        let latest = f.service.get_latest_chapter_numbers_map().unwrap();
        assert_eq!(latest[&1].len(), 1);
        assert_eq!(latest[&1][0].number, 12.0);
        assert_eq!(latest[&1][0].provider, "stub");
    }

    #[tokio::test]
    async fn test_empty_manga_cache() {
        let f = fixture(&["1"]);
        f.service.get_chapter_container("stub", 1, &titles(), None).await.unwrap();
        f.service.get_chapter_container("stub", 11, &titles(), None).await.unwrap();

        assert_eq!(f.service.empty_manga_cache(1).unwrap(), 1);
        assert!(f.service.cached_container("stub", 1).is_none());
        assert!(f.service.cached_container("stub", 11).is_some());
    }
}
