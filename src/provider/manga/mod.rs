//! Manga provider contract and built-in manga providers

mod comick;
mod local;
mod mangadex;
pub mod parser;

pub use comick::{ComicK, COMICK_PROVIDER_ID};
pub use local::{LocalProvider, LOCAL_PROVIDER_ID};
pub use mangadex::{Mangadex, MANGADEX_PROVIDER_ID};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::{Result, SearchOptions, SearchResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterDetails {
    pub provider: String,
    pub id: String,
    pub url: String,
    pub title: String,
    /// Human-readable chapter label, e.g. "12.5"
    pub chapter: String,
    /// Position in the sorted list
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanlator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub rating: i32,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, rename = "isPDF")]
    pub is_pdf: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterPage {
    pub provider: String,
    pub url: String,
    pub index: usize,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Page bytes held in memory by local providers
    #[serde(skip)]
    pub buf: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MangaProviderSettings {
    pub supports_multi_scanlator: bool,
    pub supports_multi_language: bool,
}

/// Manga capability contract
#[async_trait]
pub trait MangaProvider: Send + Sync {
    async fn search(&self, opts: &SearchOptions) -> Result<Vec<SearchResult>>;

    async fn find_chapters(&self, manga_id: &str) -> Result<Vec<ChapterDetails>>;

    async fn find_chapter_pages(&self, chapter_id: &str) -> Result<Vec<ChapterPage>>;

    fn settings(&self) -> MangaProviderSettings;
}

/// Numeric value of a chapter label; labels that are not numbers sort last.
pub fn chapter_number(chapter: &str) -> f64 {
    chapter.trim().parse::<f64>().ok().filter(|n| n.is_finite()).unwrap_or(f64::MAX)
}

/// Sort ascending by numeric chapter with a lexicographic tie-break, then renumber `index`.
pub fn sort_chapters(chapters: &mut [ChapterDetails]) {
    chapters.sort_by(|a, b| {
        chapter_number(&a.chapter)
            .partial_cmp(&chapter_number(&b.chapter))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chapter.cmp(&b.chapter))
    });
    for (i, chapter) in chapters.iter_mut().enumerate() {
        chapter.index = i as u32;
    }
}

/// Sort pages by their provider index, then make `index` equal to position.
pub fn normalize_pages(pages: &mut [ChapterPage]) {
    pages.sort_by_key(|p| p.index);
    for (i, page) in pages.iter_mut().enumerate() {
        page.index = i;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(label: &str) -> ChapterDetails {
        ChapterDetails {
            chapter: label.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sort_chapters() {
        let mut chapters = vec![
            chapter("10"),
            chapter("2"),
            chapter("1.5"),
            chapter("extra"),
            chapter("02"),
            chapter("1"),
        ];
        sort_chapters(&mut chapters);

        let labels: Vec<&str> = chapters.iter().map(|c| c.chapter.as_str()).collect();
        assert_eq!(labels, vec!["1", "1.5", "02", "2", "10", "extra"]);
        assert!(chapters.iter().enumerate().all(|(i, c)| c.index == i as u32));
    }

    #[test]
    fn test_normalize_pages() {
        let mut pages = vec![
            ChapterPage { index: 4, url: "b".to_string(), ..Default::default() },
            ChapterPage { index: 1, url: "a".to_string(), ..Default::default() },
        ];
        normalize_pages(&mut pages);
        assert_eq!(pages[0].url, "a");
        assert_eq!(pages[0].index, 0);
        assert_eq!(pages[1].index, 1);
    }

    #[test]
    fn test_chapter_details_json() {
        let details = ChapterDetails {
            is_pdf: true,
            updated_at: "2024-01-01".to_string(),
            ..chapter("1")
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["isPDF"], true);
        assert_eq!(json["updatedAt"], "2024-01-01");
        assert!(json.get("scanlator").is_none());
    }
}
