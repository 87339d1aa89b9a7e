//! Page lists

use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::downloader::{parse_chapter_dir_name, read_registry};
use super::image::decode_config;
use super::{
    chapter_bucket, chapter_key, page_bucket, page_dimensions_bucket, page_key, ChapterContainer,
    MangaError, PageContainer, PageDimension, Result,
};
use crate::extension::ExtensionBank;
use crate::filecache::FileCache;
use crate::provider::manga::{normalize_pages, LOCAL_PROVIDER_ID};
use crate::provider::{ChapterPage, ProviderError};
use crate::proxy::ImageProxy;
use crate::utils::catch_panic;

pub struct PageService {
    cache: Arc<FileCache>,
    bank: Arc<ExtensionBank>,
    proxy: Arc<dyn ImageProxy>,
    download_dir: PathBuf,
}

impl PageService {
    pub fn new(
        cache: Arc<FileCache>,
        bank: Arc<ExtensionBank>,
        proxy: Arc<dyn ImageProxy>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            bank,
            proxy,
            download_dir: download_dir.into(),
        }
    }

    /// Pages of a chapter, from the download directory when available.
    ///
    /// The chapter list must have been loaded first; otherwise `NoChapters`
    /// tells the caller to refresh it.
    pub async fn get_page_container(
        &self,
        provider: &str,
        media_id: i32,
        chapter_id: &str,
        want_dimensions: bool,
        offline: bool,
    ) -> Result<PageContainer> {
        if provider != LOCAL_PROVIDER_ID {
            if let Some(container) = self.downloaded_page_container(provider, media_id, chapter_id).await? {
                debug!(provider, media_id, chapter_id, "manga: Serving downloaded chapter");
                return Ok(container);
            }
            if offline {
                return Err(MangaError::ChapterNotDownloaded);
            }
        }

        let bucket = page_bucket(provider, media_id);
        let key = page_key(provider, media_id, chapter_id);

        let cached: Option<PageContainer> = self.cache.get(&bucket, &key).unwrap_or_else(|e| {
            warn!(key = %key, "manga: Ignoring unreadable page cache: {}", e);
            None
        });
        if let Some(mut container) = cached {
            debug!(key = %key, "manga: Page container cache HIT");
            if want_dimensions {
                container.page_dimensions = self.page_dimensions(provider, media_id, chapter_id, &container.pages).await;
            }
            return Ok(container);
        }

        let chapters: ChapterContainer = self
            .cache
            .get(&chapter_bucket(provider, media_id), &chapter_key(provider, media_id))
            .unwrap_or(None)
            .ok_or(MangaError::NoChapters)?;
        let chapter = chapters.chapter(chapter_id).ok_or(MangaError::ChapterNotFound)?;

        let source = self.bank.get_manga(provider)?;
        let mut pages = source.find_chapter_pages(&chapter.id).await?;
        if pages.is_empty() {
            return Err(ProviderError::NoPages.into());
        }
        for page in &mut pages {
            page.provider = provider.to_string();
        }
        normalize_pages(&mut pages);

        let page_dimensions = if want_dimensions {
            self.page_dimensions(provider, media_id, chapter_id, &pages).await
        } else {
            HashMap::new()
        };

        let container = PageContainer {
            media_id,
            provider: provider.to_string(),
            chapter_id: chapter_id.to_string(),
            pages,
            page_dimensions,
            is_downloaded: false,
        };
        if let Err(e) = self.cache.set(&bucket, &key, &container) {
            warn!(key = %key, "manga: Failed to populate page cache: {}", e);
        }

        info!(provider, media_id, chapter_id, pages = container.pages.len(), "manga: Fetched page container");
        Ok(container)
    }

    /// Page container backed by a fully downloaded chapter directory
    pub(crate) async fn downloaded_page_container(
        &self,
        provider: &str,
        media_id: i32,
        chapter_id: &str,
    ) -> Result<Option<PageContainer>> {
        let download_dir = self.download_dir.clone();
        let (provider, chapter_id) = (provider.to_string(), chapter_id.to_string());

        tokio::task::spawn_blocking(move || -> Result<Option<PageContainer>> {
            let entries = match std::fs::read_dir(&download_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let found = entries.filter_map(|e| e.ok()).find_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let id = parse_chapter_dir_name(&name)?;
                (id.provider == provider && id.media_id == media_id && id.chapter_id == chapter_id)
                    .then_some(name)
            });
            let Some(dir_name) = found else {
                return Ok(None);
            };

            let Some(registry) = read_registry(&download_dir.join(&dir_name))? else {
                return Ok(None);
            };

            let mut pages = Vec::with_capacity(registry.len());
            let mut page_dimensions = HashMap::with_capacity(registry.len());
            for (index, info) in registry {
                pages.push(ChapterPage {
                    provider: provider.clone(),
                    url: format!("{}/{}", dir_name, info.filename),
                    index,
                    ..Default::default()
                });
                page_dimensions.insert(
                    index,
                    PageDimension {
                        width: info.width,
                        height: info.height,
                    },
                );
            }
            normalize_pages(&mut pages);

            Ok(Some(PageContainer {
                media_id,
                provider,
                chapter_id,
                pages,
                page_dimensions,
                is_downloaded: true,
            }))
        })
        .await
        .map_err(std::io::Error::other)?
    }

    /// Width and height of each page, cached per chapter. Pages that cannot be
    /// fetched or decoded are left out.
    async fn page_dimensions(
        &self,
        provider: &str,
        media_id: i32,
        chapter_id: &str,
        pages: &[ChapterPage],
    ) -> HashMap<usize, PageDimension> {
        let bucket = page_dimensions_bucket(provider, media_id);
        let key = page_key(provider, media_id, chapter_id);

        if let Ok(Some(dimensions)) = self.cache.get::<HashMap<usize, PageDimension>>(&bucket, &key) {
            return dimensions;
        }

        let fetches = pages.iter().map(|page| {
            catch_panic("manga", async move {
                let buf = match &page.buf {
                    Some(buf) => buf.clone(),
                    None => self.proxy.get_image(&page.url, &page.headers).await.ok()?,
                };
                let info = decode_config(&buf).ok()?;
                Some((
                    page.index,
                    PageDimension {
                        width: info.width,
                        height: info.height,
                    },
                ))
            })
        });
        let dimensions: HashMap<usize, PageDimension> =
            join_all(fetches).await.into_iter().flatten().flatten().collect();

        if let Err(e) = self.cache.set(&bucket, &key, &dimensions) {
            warn!(key = %key, "manga: Failed to cache page dimensions: {}", e);
        }
        dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manga::chapter::tests::{bank_with, StubManga};
    use crate::manga::downloader::tests::StubProxy;
    use crate::manga::downloader::{format_chapter_dir_name, DownloadId, PageInfo, Registry, REGISTRY_FILENAME};
    use crate::manga::ChapterService;
    use crate::db::Database;
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        chapters: ChapterService,
        pages: PageService,
        proxy: Arc<StubProxy>,
        download_dir: PathBuf,
    }

    fn fixture(page_count: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path().join("cache")).unwrap());
        let bank = bank_with("stub", Arc::new(StubManga::new(&["1", "2"], page_count)));
        let proxy = Arc::new(StubProxy::new());
        let download_dir = dir.path().join("manga");
        Fixture {
            chapters: ChapterService::new(
                cache.clone(),
                bank.clone(),
                Arc::new(Database::in_memory().unwrap()),
                &download_dir,
            ),
            pages: PageService::new(cache, bank, proxy.clone(), &download_dir),
            proxy,
            download_dir,
            _dir: dir,
        }
    }

    async fn load_chapters(f: &Fixture) {
        f.chapters
            .get_chapter_container("stub", 1, &["Berserk".to_string()], None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_requires_chapter_list() {
        let f = fixture(3);
        let err = f.pages.get_page_container("stub", 1, "ch-1", false, false).await.unwrap_err();
        assert!(matches!(err, MangaError::NoChapters));
    }

    #[tokio::test]
    async fn test_unknown_chapter() {
        let f = fixture(3);
        load_chapters(&f).await;
        let err = f.pages.get_page_container("stub", 1, "ch-9", false, false).await.unwrap_err();
        assert!(matches!(err, MangaError::ChapterNotFound));
    }

    #[tokio::test]
    async fn test_no_pages() {
        let f = fixture(0);
        load_chapters(&f).await;
        let err = f.pages.get_page_container("stub", 1, "ch-1", false, false).await.unwrap_err();
        assert!(matches!(err, MangaError::Provider(ProviderError::NoPages)));
    }

    #[tokio::test]
    async fn test_pages_are_normalized_with_dimensions() {
        let f = fixture(3);
        load_chapters(&f).await;

        let container = f.pages.get_page_container("stub", 1, "ch-1", true, false).await.unwrap();
        assert!(!container.is_downloaded);
        assert_eq!(container.pages.len(), 3);
        for (i, page) in container.pages.iter().enumerate() {
            assert_eq!(page.index, i);
            assert_eq!(page.provider, "stub");
        }
        // The stub lists pages in reverse
        assert_eq!(container.pages[0].url, "https://img.example/2.png");
        assert_eq!(container.page_dimensions.len(), 3);
        assert_eq!(container.page_dimensions[&0], PageDimension { width: 800, height: 1200 });

        // Second read hits both the page and the dimension caches
        let again = f.pages.get_page_container("stub", 1, "ch-1", true, false).await.unwrap();
        assert_eq!(again.page_dimensions.len(), 3);
        assert_eq!(f.proxy.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_returns_pages() {
        let f = fixture(3);
        load_chapters(&f).await;
        std::fs::write(f._dir.path().join("cache").join("manga_stub_pages_1"), b"").unwrap();

        let container = f.pages.get_page_container("stub", 1, "ch-1", false, false).await.unwrap();
        assert_eq!(container.pages.len(), 3);
    }

    #[tokio::test]
    async fn test_offline_requires_download() {
        let f = fixture(3);
        load_chapters(&f).await;
        let err = f.pages.get_page_container("stub", 1, "ch-1", false, true).await.unwrap_err();
        assert!(matches!(err, MangaError::ChapterNotDownloaded));
    }

    #[tokio::test]
    async fn test_downloaded_chapter_served_offline() {
        let f = fixture(3);
        let id = DownloadId {
            provider: "stub".to_string(),
            media_id: 1,
            chapter_id: "ch-1".to_string(),
            chapter_number: "1".to_string(),
        };
        let dir_name = format_chapter_dir_name(&id);
        let chapter_dir = f.download_dir.join(&dir_name);
        std::fs::create_dir_all(&chapter_dir).unwrap();

        let mut registry = Registry::new();
        for index in 0..2 {
            registry.insert(
                index,
                PageInfo {
                    index,
                    filename: format!("{:02}.png", index + 1),
                    original_url: format!("https://img/{}", index),
                    size: 10,
                    width: 100,
                    height: 200,
                },
            );
        }
        std::fs::write(chapter_dir.join(REGISTRY_FILENAME), serde_json::to_vec(&registry).unwrap()).unwrap();

        let container = f.pages.get_page_container("stub", 1, "ch-1", false, true).await.unwrap();
        assert!(container.is_downloaded);
        assert_eq!(container.pages.len(), 2);
        assert_eq!(container.pages[1].url, format!("{}/02.png", dir_name));
        assert_eq!(container.pages[1].index, 1);
        assert_eq!(container.page_dimensions[&1].height, 200);
    }
}
