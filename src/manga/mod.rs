//! Manga services
//!
//! Chapter lists, page lists and the chapter download pipeline. Everything
//! fetched from a provider is cached in the [`FileCache`](crate::filecache::FileCache);
//! downloaded chapters live in the download directory, one folder per chapter.

mod chapter;
mod downloader;
pub mod image;
mod manager;
mod page;
mod queue;

pub use chapter::{ChapterService, LatestChapterNumber};
pub use downloader::{
    escape_chapter_id, format_chapter_dir_name, parse_chapter_dir_name, unescape_chapter_id,
    ChapterDownloader, DownloadId, PageInfo, Registry, REGISTRY_FILENAME,
};
pub use manager::{
    ChapterDownloadInfo, DownloadChapterOptions, DownloadListItem, DownloadManager,
    MediaDownloadData, MediaMap, ProviderDownloadMap,
};
pub use page::PageService;
pub use queue::{DownloadQueue, QueueItem};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::extension::ExtensionError;
use crate::filecache::{Bucket, CacheError, PermanentBucket, DEFAULT_TTL};
use crate::provider::{ChapterDetails, ChapterPage, ProviderError};
use crate::resolver::ResolverError;

#[derive(Debug, thiserror::Error)]
pub enum MangaError {
    #[error("no results found")]
    NoResults,

    #[error("no chapters found")]
    NoChapters,

    #[error("no titles provided")]
    NoTitlesProvided,

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("chapter not found")]
    ChapterNotFound,

    #[error("chapter not downloaded")]
    ChapterNotDownloaded,

    #[error("downloaded {downloaded} of {total} pages")]
    IncompleteDownload { downloaded: usize, total: usize },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("mapping store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MangaError>;

impl From<ResolverError> for MangaError {
    fn from(err: ResolverError) -> Self {
        match err {
            ResolverError::NoTitlesProvided => MangaError::NoTitlesProvided,
            ResolverError::NoResults => MangaError::NoResults,
            ResolverError::Store(e) => MangaError::Store(e),
        }
    }
}

impl From<ExtensionError> for MangaError {
    fn from(err: ExtensionError) -> Self {
        match err {
            ExtensionError::ProviderNotFound(id) => MangaError::ProviderNotFound(id),
            ExtensionError::KindMismatch { id, .. } => MangaError::ProviderNotFound(id),
            other => MangaError::ProviderNotFound(other.to_string()),
        }
    }
}

/// All chapters of one manga on one provider
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterContainer {
    pub media_id: i32,
    pub provider: String,
    pub chapters: Vec<ChapterDetails>,
}

impl ChapterContainer {
    pub fn chapter(&self, chapter_id: &str) -> Option<&ChapterDetails> {
        self.chapters.iter().find(|c| c.id == chapter_id)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageDimension {
    pub width: u32,
    pub height: u32,
}

/// The pages of one chapter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContainer {
    pub media_id: i32,
    pub provider: String,
    pub chapter_id: String,
    pub pages: Vec<ChapterPage>,
    /// Keyed by page index; only set when dimensions were requested
    #[serde(default)]
    pub page_dimensions: HashMap<usize, PageDimension>,
    #[serde(default)]
    pub is_downloaded: bool,
}

pub(crate) fn chapter_bucket(provider: &str, media_id: i32) -> Bucket {
    Bucket::new(format!("manga_{}_chapters_{}", provider, media_id), DEFAULT_TTL)
}

pub(crate) fn page_bucket(provider: &str, media_id: i32) -> Bucket {
    Bucket::new(format!("manga_{}_pages_{}", provider, media_id), DEFAULT_TTL)
}

pub(crate) fn page_dimensions_bucket(provider: &str, media_id: i32) -> Bucket {
    Bucket::new(
        format!("manga_{}_page-dimensions_{}", provider, media_id),
        DEFAULT_TTL,
    )
}

/// Chapter containers of downloaded chapters; never expires
pub(crate) fn downloaded_chapter_bucket(provider: &str, media_id: i32) -> PermanentBucket {
    PermanentBucket::new(format!("manga_downloaded_{}_chapters_{}", provider, media_id))
}

pub(crate) fn chapter_key(provider: &str, media_id: i32) -> String {
    format!("{}${}", provider, media_id)
}

pub(crate) fn page_key(provider: &str, media_id: i32, chapter_id: &str) -> String {
    format!("{}${}${}", provider, media_id, chapter_id)
}

/// `(provider, media_id)` of a temporary chapter bucket name
pub(crate) fn parse_chapter_bucket_name(name: &str) -> Option<(String, i32)> {
    let rest = name.strip_prefix("manga_")?;
    if rest.starts_with("downloaded_") {
        return None;
    }
    let (provider, media_id) = rest.rsplit_once("_chapters_")?;
    if provider.is_empty() {
        return None;
    }
    Some((provider.to_string(), media_id.parse().ok()?))
}

/// Whether `name` is a temporary manga bucket belonging to `media_id`
pub(crate) fn is_media_bucket(name: &str, media_id: i32) -> bool {
    name.starts_with("manga_")
        && !name.starts_with("manga_downloaded_")
        && name.ends_with(&format!("_{}", media_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_names() {
        assert_eq!(chapter_bucket("comick", 12).name(), "manga_comick_chapters_12");
        assert_eq!(page_bucket("comick", 12).name(), "manga_comick_pages_12");
        assert_eq!(
            page_dimensions_bucket("comick", 12).name(),
            "manga_comick_page-dimensions_12"
        );
        assert_eq!(
            downloaded_chapter_bucket("comick", 12).name(),
            "manga_downloaded_comick_chapters_12"
        );
        assert_eq!(chapter_key("comick", 12), "comick$12");
        assert_eq!(page_key("comick", 12, "abc"), "comick$12$abc");
    }

    #[test]
    fn test_parse_chapter_bucket_name() {
        assert_eq!(
            parse_chapter_bucket_name("manga_local-manga_chapters_7"),
            Some(("local-manga".to_string(), 7))
        );
        assert_eq!(parse_chapter_bucket_name("manga_comick_pages_7"), None);
        assert_eq!(parse_chapter_bucket_name("manga_downloaded_comick_chapters_7"), None);
        assert_eq!(parse_chapter_bucket_name("manga_comick_chapters_x"), None);
    }

    #[test]
    fn test_is_media_bucket() {
        assert!(is_media_bucket("manga_comick_pages_12", 12));
        assert!(!is_media_bucket("manga_comick_pages_112", 12) && is_media_bucket("manga_comick_pages_112", 112));
        assert!(!is_media_bucket("manga_downloaded_comick_chapters_12", 12));
        assert!(!is_media_bucket("onlinestream_gogoanime_episode-list_12", 12));
    }

    #[test]
    fn test_container_lookup() {
        let container = ChapterContainer {
            media_id: 1,
            provider: "comick".to_string(),
            chapters: vec![ChapterDetails {
                id: "a".to_string(),
                ..Default::default()
            }],
        };
        assert!(container.chapter("a").is_some());
        assert!(container.chapter("b").is_none());
    }
}
