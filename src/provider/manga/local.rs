//! Filesystem-backed manga provider
//!
//! Layout: `{root}/{manga}/{chapter}` where a chapter is either a folder of
//! images or an archive (`.cbz`, `.zip`, `.cbr`, `.pdf`). Pages are read into
//! memory; only folders and zip archives can be paged.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use super::parser::{clean_chapter, is_image_file, parse_page_filename, scan_chapter_filename};
use super::{normalize_pages, sort_chapters, ChapterDetails, ChapterPage, MangaProvider, MangaProviderSettings};
use crate::provider::{ProviderError, Result, SearchOptions, SearchResult};
use crate::resolver::comparison::sorensen_dice;

pub const LOCAL_PROVIDER_ID: &str = "local-manga";

const ARCHIVE_EXTENSIONS: [&str; 4] = ["cbz", "zip", "cbr", "pdf"];
const PAGEABLE_ARCHIVES: [&str; 2] = ["cbz", "zip"];

pub struct LocalProvider {
    root: RwLock<Option<PathBuf>>,
}

impl LocalProvider {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root: RwLock::new(root),
        }
    }

    pub fn set_source_directory(&self, dir: impl Into<PathBuf>) {
        *self.root.write() = Some(dir.into());
    }

    fn root(&self) -> Result<PathBuf> {
        self.root
            .read()
            .clone()
            .ok_or_else(|| ProviderError::InvalidResponse("local source directory not set".to_string()))
    }

    /// Read one page by its relative URL, looking inside archives when needed.
    pub async fn read_page(&self, url: &str) -> Result<Vec<u8>> {
        let root = self.root()?;
        let url = url.to_string();
        blocking(move || read_page_sync(&root, &url)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProviderError::Io(std::io::Error::other(e)))?
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Join a client-supplied relative path onto `root`, refusing anything that escapes it.
fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ProviderError::InvalidResponse("invalid local path".to_string()));
    }
    Ok(root.join(relative))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_chapter_folder(dir: &Path) -> std::io::Result<bool> {
    let mut has_image = false;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() || !is_image_file(&file_name(&path)) {
            return Ok(false);
        }
        has_image = true;
    }
    Ok(has_image)
}

fn search_sync(root: &Path, query: &str) -> Result<Vec<SearchResult>> {
    let mut results = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name = file_name(&path);
        results.push(SearchResult {
            provider: LOCAL_PROVIDER_ID.to_string(),
            id: name.clone(),
            rating: sorensen_dice(query, &name),
            title: name,
            ..Default::default()
        });
    }
    results.sort_by(|a, b| b.rating.total_cmp(&a.rating));
    Ok(results)
}

fn find_chapters_sync(root: &Path, manga_id: &str) -> Result<Vec<ChapterDetails>> {
    let manga_dir = resolve(root, manga_id)?;
    let mut chapters = Vec::new();

    for entry in std::fs::read_dir(&manga_dir)? {
        let path = entry?.path();
        let name = file_name(&path);

        let is_chapter = if path.is_dir() {
            is_chapter_folder(&path)?
        } else {
            ARCHIVE_EXTENSIONS.contains(&extension(&path).as_str())
        };
        if !is_chapter {
            continue;
        }

        let scanned = scan_chapter_filename(&name);
        let Some(first) = scanned.chapter.first() else {
            debug!(name = %name, "local manga: Could not find chapter number");
            continue;
        };

        let label = clean_chapter(first);
        let mut title = format!("Chapter {}", scanned.chapter.iter().map(|c| clean_chapter(c)).collect::<Vec<_>>().join("-"));
        if !scanned.chapter_title.is_empty() {
            title.push_str(&format!(" - {}", scanned.chapter_title));
        }

        let id = format!("{}/{}", manga_id, name);
        chapters.push(ChapterDetails {
            provider: LOCAL_PROVIDER_ID.to_string(),
            url: id.clone(),
            id,
            title,
            chapter: label,
            is_pdf: scanned.is_pdf,
            ..Default::default()
        });
    }

    sort_chapters(&mut chapters);
    Ok(chapters)
}

/// Page number first, file name second; names without a number sort after numbered ones.
fn compare_page_names(a: &str, b: &str) -> std::cmp::Ordering {
    let number = |name: &str| parse_page_filename(name).map(|p| p.number).unwrap_or(f64::MAX);
    number(a).total_cmp(&number(b)).then_with(|| a.cmp(b))
}

fn page(chapter_id: &str, name: &str, index: usize, buf: Vec<u8>) -> ChapterPage {
    ChapterPage {
        provider: LOCAL_PROVIDER_ID.to_string(),
        url: format!("{}/{}", chapter_id, name),
        index,
        headers: Default::default(),
        buf: Some(buf),
    }
}

fn find_pages_sync(root: &Path, chapter_id: &str) -> Result<Vec<ChapterPage>> {
    let path = resolve(root, chapter_id)?;

    let mut pages = if path.is_dir() {
        let mut names: Vec<String> = std::fs::read_dir(&path)?
            .filter_map(|e| e.ok())
            .map(|e| file_name(&e.path()))
            .filter(|n| is_image_file(n))
            .collect();
        names.sort_by(|a, b| compare_page_names(a, b));

        names
            .iter()
            .enumerate()
            .map(|(i, name)| Ok(page(chapter_id, name, i, std::fs::read(path.join(name))?)))
            .collect::<Result<Vec<_>>>()?
    } else if PAGEABLE_ARCHIVES.contains(&extension(&path).as_str()) {
        let mut archive = zip::ZipArchive::new(std::fs::File::open(&path)?)
            .map_err(|e| ProviderError::Io(e.into()))?;

        let mut names: Vec<String> = archive
            .file_names()
            .filter(|n| !n.ends_with('/') && is_image_file(n))
            .map(str::to_string)
            .collect();
        names.sort_by(|a, b| compare_page_names(a, b));

        let mut pages = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let mut entry = archive
                .by_name(name)
                .map_err(|e| ProviderError::Io(e.into()))?;
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            pages.push(page(chapter_id, name, i, buf));
        }
        pages
    } else {
        return Err(ProviderError::NotSupported);
    };

    normalize_pages(&mut pages);
    Ok(pages)
}

fn read_page_sync(root: &Path, url: &str) -> Result<Vec<u8>> {
    let path = resolve(root, url)?;
    if path.is_file() {
        return Ok(std::fs::read(&path)?);
    }

    // "{manga}/{archive}/{entry}": find the archive prefix
    let mut archive_path = path.clone();
    while let Some(parent) = archive_path.parent().map(Path::to_path_buf) {
        if parent == root {
            break;
        }
        archive_path = parent;
        if archive_path.is_file() && PAGEABLE_ARCHIVES.contains(&extension(&archive_path).as_str()) {
            let entry_name = path
                .strip_prefix(&archive_path)
                .map_err(|_| ProviderError::NoPages)?
                .to_string_lossy()
                .replace('\\', "/");
            let mut archive = zip::ZipArchive::new(std::fs::File::open(&archive_path)?)
                .map_err(|e| ProviderError::Io(e.into()))?;
            let mut entry = archive
                .by_name(&entry_name)
                .map_err(|_| ProviderError::NoPages)?;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(buf);
        }
    }

    Err(ProviderError::NoPages)
}

#[async_trait]
impl MangaProvider for LocalProvider {
    async fn search(&self, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let root = self.root()?;
        let query = opts.query.clone();
        let results = blocking(move || search_sync(&root, &query)).await?;

        if results.is_empty() {
            warn!("local manga: No results found");
            return Err(ProviderError::NoResults);
        }
        Ok(results)
    }

    async fn find_chapters(&self, manga_id: &str) -> Result<Vec<ChapterDetails>> {
        let root = self.root()?;
        let id = manga_id.to_string();
        let chapters = blocking(move || find_chapters_sync(&root, &id)).await?;

        if chapters.is_empty() {
            warn!(manga_id, "local manga: No chapters found");
            return Err(ProviderError::NoChapters);
        }

        info!(count = chapters.len(), "local manga: Found chapters");
        Ok(chapters)
    }

    async fn find_chapter_pages(&self, chapter_id: &str) -> Result<Vec<ChapterPage>> {
        let root = self.root()?;
        let id = chapter_id.to_string();
        let pages = blocking(move || find_pages_sync(&root, &id)).await?;

        if pages.is_empty() {
            warn!(chapter_id, "local manga: No pages found");
            return Err(ProviderError::NoPages);
        }
        Ok(pages)
    }

    fn settings(&self) -> MangaProviderSettings {
        MangaProviderSettings::default()
    }
}
