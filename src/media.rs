//! Host media records

use serde::{Deserialize, Serialize};

/// A media entry as known to the host metadata platform
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: i32,
    /// Ordered by preference: romaji first, then English, then synonyms
    #[serde(default)]
    pub titles: Vec<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub episodes: Option<i32>,
    #[serde(default)]
    pub is_adult: bool,
}

impl Media {
    pub fn romaji_title(&self) -> Option<&str> {
        self.titles.first().map(String::as_str)
    }

    pub fn english_title(&self) -> Option<&str> {
        self.titles.get(1).map(String::as_str)
    }
}

/// The user's tracked media, supplied by the host
pub type MediaCollection = Vec<Media>;
