//! ComicK JSON API provider

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{ChapterDetails, ChapterPage, MangaProvider, MangaProviderSettings};
use crate::provider::{ProviderError, Result, SearchOptions, SearchResult};
use crate::resolver::comparison::sorensen_dice;

pub const COMICK_PROVIDER_ID: &str = "comick";

const API_URL: &str = "https://api.comick.fun";
const IMAGE_URL: &str = "https://meo.comick.pictures";
const USER_AGENT: &str = "Mozilla/5.0";

#[derive(Debug, Deserialize)]
struct SearchItem {
    hid: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    md_titles: Vec<MdTitle>,
    #[serde(default)]
    md_covers: Vec<MdCover>,
}

#[derive(Debug, Deserialize)]
struct MdTitle {
    title: String,
}

#[derive(Debug, Deserialize)]
struct MdCover {
    #[serde(default)]
    b2key: String,
}

#[derive(Debug, Deserialize)]
struct ChaptersResponse {
    #[serde(default)]
    chapters: Vec<ComicChapter>,
}

#[derive(Debug, Deserialize)]
struct ComicChapter {
    hid: String,
    #[serde(default)]
    chap: Option<String>,
    #[serde(default)]
    lang: String,
    #[serde(default)]
    up_count: i32,
    #[serde(default)]
    down_count: i32,
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    group_name: Option<Vec<String>>,
    #[serde(default)]
    md_images: Vec<MdImage>,
}

#[derive(Debug, Deserialize)]
struct MdImage {
    b2key: String,
}

#[derive(Debug, Deserialize)]
struct ChapterResponse {
    chapter: Option<ComicChapter>,
}

pub struct ComicK {
    http: reqwest::Client,
    base_url: String,
}

impl ComicK {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: API_URL.to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "Status: {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    fn search_url(&self, opts: &SearchOptions) -> String {
        let mut url = format!(
            "{}/v1.0/search?q={}&limit=25&page=1",
            self.base_url,
            urlencoding::encode(&opts.query)
        );
        if let Some(year) = opts.year.filter(|y| *y > 0) {
            url.push_str(&format!("&from={}&to={}", year, year));
        }
        url
    }
}

fn to_search_results(query: &str, items: Vec<SearchItem>) -> Vec<SearchResult> {
    items
        .into_iter()
        .filter(|item| !item.slug.contains("fan-colored"))
        .map(|item| {
            let title = item
                .title
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| item.slug.clone());
            let image = item
                .md_covers
                .first()
                .filter(|c| !c.b2key.is_empty())
                .map(|c| format!("{}/{}", IMAGE_URL, c.b2key))
                .unwrap_or_default();

            SearchResult {
                provider: COMICK_PROVIDER_ID.to_string(),
                rating: sorensen_dice(query, &title),
                id: item.hid,
                title,
                synonyms: item.md_titles.into_iter().map(|t| t.title).collect(),
                year: item.year.unwrap_or_default(),
                image,
                sub_or_dub: None,
            }
        })
        .collect()
}

/// Keep one English entry per chapter label, preferring the best-voted upload.
fn to_chapter_details(base_url: &str, chapters: Vec<ComicChapter>) -> Vec<ChapterDetails> {
    let mut by_label: HashMap<String, ChapterDetails> = HashMap::new();
    let mut count = 0;

    for chapter in chapters {
        let Some(label) = chapter.chap.filter(|c| !c.is_empty()) else {
            continue;
        };
        if chapter.lang != "en" {
            continue;
        }

        let rating = chapter.up_count - chapter.down_count;
        let index = match by_label.get(&label) {
            Some(prev) if rating <= prev.rating => continue,
            Some(prev) => prev.index,
            None => {
                count += 1;
                count
            }
        };

        by_label.insert(
            label.clone(),
            ChapterDetails {
                provider: COMICK_PROVIDER_ID.to_string(),
                id: chapter.hid.clone(),
                url: format!("{}/chapter/{}", base_url, chapter.hid),
                title: format!("Chapter {}", label),
                chapter: label,
                index,
                scanlator: chapter.group_name.and_then(|g| g.into_iter().next()),
                language: Some(chapter.lang),
                rating,
                updated_at: chapter.updated_at,
                is_pdf: false,
            },
        );
    }

    let mut details: Vec<ChapterDetails> = by_label.into_values().collect();
    details.sort_by_key(|c| c.index);
    details
}

#[async_trait]
impl MangaProvider for ComicK {
    async fn search(&self, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let url = self.search_url(opts);
        debug!(url = %url, "comick: Searching manga");

        let items: Vec<SearchItem> = self.get_json(&url).await?;
        let results = to_search_results(&opts.query, items);

        if results.is_empty() {
            warn!("comick: No results found");
            return Err(ProviderError::NoResults);
        }

        info!(count = results.len(), "comick: Found results");
        Ok(results)
    }

    async fn find_chapters(&self, manga_id: &str) -> Result<Vec<ChapterDetails>> {
        debug!(manga_id, "comick: Fetching chapters");

        let url = format!(
            "{}/comic/{}/chapters?lang=en&page=0&limit=1000000&chap-order=1",
            self.base_url, manga_id
        );
        let data: ChaptersResponse = self.get_json(&url).await?;
        let chapters = to_chapter_details(&self.base_url, data.chapters);

        if chapters.is_empty() {
            warn!("comick: No chapters found");
            return Err(ProviderError::NoChapters);
        }

        info!(count = chapters.len(), "comick: Found chapters");
        Ok(chapters)
    }

    async fn find_chapter_pages(&self, chapter_id: &str) -> Result<Vec<ChapterPage>> {
        debug!(chapter_id, "comick: Finding chapter pages");

        let url = format!("{}/chapter/{}", self.base_url, chapter_id);
        let data: ChapterResponse = self.get_json(&url).await?;
        let chapter = data
            .chapter
            .ok_or_else(|| ProviderError::InvalidResponse("chapter not found".to_string()))?;

        let pages: Vec<ChapterPage> = chapter
            .md_images
            .into_iter()
            .enumerate()
            .map(|(index, image)| ChapterPage {
                provider: COMICK_PROVIDER_ID.to_string(),
                url: format!("{}/{}", IMAGE_URL, image.b2key),
                index,
                headers: HashMap::new(),
                buf: None,
            })
            .collect();

        if pages.is_empty() {
            warn!("comick: No pages found");
            return Err(ProviderError::NoPages);
        }

        info!(count = pages.len(), "comick: Found pages");
        Ok(pages)
    }

    fn settings(&self) -> MangaProviderSettings {
        MangaProviderSettings {
            supports_multi_scanlator: false,
            supports_multi_language: false,
        }
    }
}
