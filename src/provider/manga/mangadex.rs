//! MangaDex JSON API provider

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info};

use super::{ChapterDetails, ChapterPage, MangaProvider, MangaProviderSettings};
use crate::provider::{ProviderError, Result, SearchOptions, SearchResult};
use crate::resolver::comparison::{is_mostly_latin, sorensen_dice};

pub const MANGADEX_PROVIDER_ID: &str = "mangadex";

const API_URL: &str = "https://api.mangadex.org";
const SITE_URL: &str = "https://mangadex.org";
const FEED_PAGE_SIZE: usize = 500;

type LocalizedTitle = HashMap<String, String>;

#[derive(Debug, Deserialize)]
struct MangaList {
    #[serde(default)]
    data: Vec<MangaData>,
}

#[derive(Debug, Deserialize)]
struct MangaData {
    id: String,
    attributes: MangaAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Deserialize)]
struct MangaAttributes {
    #[serde(default)]
    title: LocalizedTitle,
    #[serde(default, rename = "altTitles")]
    alt_titles: Vec<LocalizedTitle>,
    #[serde(default)]
    year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct Relationship {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    result: String,
    #[serde(default)]
    errors: Vec<ApiError>,
    #[serde(default)]
    data: Vec<ChapterData>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
struct ChapterData {
    id: String,
    attributes: ChapterAttributes,
}

#[derive(Debug, Deserialize)]
struct ChapterAttributes {
    #[serde(default)]
    chapter: Option<String>,
    #[serde(default, rename = "updatedAt")]
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct AtHomeResponse {
    #[serde(rename = "baseUrl")]
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
struct AtHomeChapter {
    hash: String,
    #[serde(default)]
    data: Vec<String>,
}

pub struct Mangadex {
    http: reqwest::Client,
}

impl Mangadex {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .header("Referer", "https://google.com")
            .send()
            .await?;
        Ok(response.json().await?)
    }
}

/// Pick a display title: English first, then romanized Japanese, Japanese, Korean.
fn display_title(attributes: &MangaAttributes) -> String {
    if let Some(en) = attributes.title.get("en").filter(|t| !t.is_empty()) {
        return en.clone();
    }

    if let Some(en) = attributes.alt_titles.iter().find_map(|t| t.get("en")) {
        if is_mostly_latin(en) {
            return en.clone();
        }
    }

    const FALLBACKS: [&str; 5] = ["ja-ro", "jp-ro", "jp", "ja", "ko"];
    for lang in FALLBACKS {
        if let Some(title) = attributes.title.get(lang) {
            return title.clone();
        }
    }
    for lang in FALLBACKS {
        if let Some(title) = attributes.alt_titles.iter().find_map(|t| t.get(lang)) {
            return title.clone();
        }
    }

    String::new()
}

fn alt_titles(attributes: &MangaAttributes) -> Vec<String> {
    attributes
        .alt_titles
        .iter()
        .flat_map(|t| ["en", "jp", "ja"].into_iter().filter_map(|lang| t.get(lang).cloned()))
        .collect()
}

fn cover_url(manga: &MangaData) -> String {
    manga
        .relationships
        .iter()
        .filter(|r| r.kind == "cover_art")
        .map(|r| {
            let file_name = r
                .attributes
                .as_ref()
                .and_then(|a| a.get("fileName"))
                .and_then(|f| f.as_str());
            match file_name {
                Some(name) => format!("{}/covers/{}/{}.512.jpg", SITE_URL, manga.id, name),
                None => format!("{}/covers/{}/{}.jpg.512.jpg", SITE_URL, manga.id, r.id),
            }
        })
        .last()
        .unwrap_or_default()
}

/// Feed pages arrive newest first; keep the first upload of each chapter label.
fn feed_to_chapters(mut data: Vec<ChapterData>, seen: &mut HashSet<String>, start: u32) -> Vec<ChapterDetails> {
    data.reverse();
    let mut index = start;
    let mut chapters = Vec::new();

    for chapter in data {
        let Some(label) = chapter.attributes.chapter.filter(|c| !c.is_empty()) else {
            continue;
        };
        if !seen.insert(label.clone()) {
            continue;
        }
        chapters.push(ChapterDetails {
            provider: MANGADEX_PROVIDER_ID.to_string(),
            url: format!("{}/chapter/{}", SITE_URL, chapter.id),
            id: chapter.id,
            title: format!("Chapter {}", label),
            chapter: label,
            index,
            updated_at: chapter.attributes.updated_at,
            ..Default::default()
        });
        index += 1;
    }

    chapters
}

#[async_trait]
impl MangaProvider for Mangadex {
    async fn search(&self, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let url = format!(
            "{}/manga?title={}&limit=25&offset=0&order[relevance]=desc&contentRating[]=safe&contentRating[]=suggestive&includes[]=cover_art",
            API_URL,
            urlencoding::encode(&opts.query)
        );
        debug!(url = %url, "mangadex: Searching manga");

        let list: MangaList = self.get_json(&url).await?;
        let results: Vec<SearchResult> = list
            .data
            .iter()
            .map(|manga| {
                let title = display_title(&manga.attributes);
                SearchResult {
                    provider: MANGADEX_PROVIDER_ID.to_string(),
                    id: manga.id.clone(),
                    rating: sorensen_dice(&opts.query, &title),
                    title,
                    synonyms: alt_titles(&manga.attributes),
                    year: manga.attributes.year.unwrap_or_default(),
                    image: cover_url(manga),
                    sub_or_dub: None,
                }
            })
            .collect();

        if results.is_empty() {
            error!("mangadex: No results found");
            return Err(ProviderError::NoResults);
        }

        info!(count = results.len(), "mangadex: Found results");
        Ok(results)
    }

    async fn find_chapters(&self, manga_id: &str) -> Result<Vec<ChapterDetails>> {
        debug!(manga_id, "mangadex: Finding chapters");

        let mut chapters = Vec::new();
        let mut seen = HashSet::new();

        for page in 0..=1 {
            let url = format!(
                "{}/manga/{}/feed?limit={}&translatedLanguage%5B%5D=en&includes[]=scanlation_group&includes[]=user&order[volume]=desc&order[chapter]=desc&offset={}&contentRating[]=safe&contentRating[]=suggestive&contentRating[]=erotica&contentRating[]=pornographic",
                API_URL,
                manga_id,
                FEED_PAGE_SIZE,
                FEED_PAGE_SIZE * page
            );
            let feed: FeedResponse = self.get_json(&url).await?;

            if feed.result == "error" {
                let detail = feed.errors.first().map(|e| e.detail.clone()).unwrap_or_default();
                error!("mangadex: Could not find chapters: {}", detail);
                return Err(ProviderError::InvalidResponse(detail));
            }

            let batch = feed_to_chapters(feed.data, &mut seen, chapters.len() as u32);
            if batch.is_empty() {
                break;
            }
            chapters.extend(batch);
        }

        if chapters.is_empty() {
            error!("mangadex: No chapters found");
            return Err(ProviderError::NoChapters);
        }

        info!(count = chapters.len(), "mangadex: Found chapters");
        Ok(chapters)
    }

    async fn find_chapter_pages(&self, chapter_id: &str) -> Result<Vec<ChapterPage>> {
        debug!(chapter_id, "mangadex: Finding chapter pages");

        let url = format!("{}/at-home/server/{}", API_URL, chapter_id);
        let data: AtHomeResponse = self.get_json(&url).await?;

        let headers = HashMap::from([("Referer".to_string(), SITE_URL.to_string())]);
        let pages: Vec<ChapterPage> = data
            .chapter
            .data
            .iter()
            .enumerate()
            .map(|(index, file)| ChapterPage {
                provider: MANGADEX_PROVIDER_ID.to_string(),
                url: format!("{}/data/{}/{}", data.base_url, data.chapter.hash, file),
                index,
                headers: headers.clone(),
                buf: None,
            })
            .collect();

        if pages.is_empty() {
            error!("mangadex: No pages found");
            return Err(ProviderError::NoPages);
        }

        info!(count = pages.len(), "mangadex: Found pages");
        Ok(pages)
    }

    fn settings(&self) -> MangaProviderSettings {
        MangaProviderSettings::default()
    }
}
