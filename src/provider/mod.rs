//! Content provider abstraction layer
//!
//! Providers unify scrapers and API clients behind three capability contracts:
//! manga, online streams and torrent listings.

pub mod manga;
pub mod onlinestream;
pub mod torrent;

pub use manga::{ChapterDetails, ChapterPage, MangaProvider, MangaProviderSettings};
pub use onlinestream::{
    EpisodeDetails, EpisodeServer, OnlinestreamProvider, OnlinestreamProviderSettings,
};
pub use torrent::{AnimeTorrent, TorrentProvider, TorrentProviderSettings};

use serde::{Deserialize, Serialize};

use crate::extractor::ExtractorError;

/// Unified error type for provider operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no results found")]
    NoResults,

    #[error("no chapters found")]
    NoChapters,

    #[error("no pages found")]
    NoPages,

    #[error("no episodes found")]
    NoEpisodes,

    #[error("no source found")]
    NoSource,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Extractor(#[from] ExtractorError),

    #[error("Operation not supported")]
    NotSupported,
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Capability contract a provider is registered under
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Manga,
    Onlinestream,
    Torrent,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Manga => write!(f, "manga"),
            ProviderKind::Onlinestream => write!(f, "onlinestream"),
            ProviderKind::Torrent => write!(f, "torrent"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manga" | "manga-provider" => Ok(ProviderKind::Manga),
            "onlinestream" | "onlinestream-provider" => Ok(ProviderKind::Onlinestream),
            "torrent" | "anime-torrent-provider" => Ok(ProviderKind::Torrent),
            _ => Err(format!("Unknown provider kind: {}", s)),
        }
    }
}

/// Cosmetic classification; special providers may declare non-standard semantics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    Main,
    Special,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::Main => write!(f, "main"),
            ProviderType::Special => write!(f, "special"),
        }
    }
}

/// A provider-native search hit
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub provider: String,
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub image: String,
    /// Similarity to the query in [0, 1]; zero lets the resolver score it
    #[serde(default, rename = "searchRating")]
    pub rating: f64,
    /// Set by online stream providers
    #[serde(default)]
    pub sub_or_dub: Option<SubOrDub>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubOrDub {
    Sub,
    Dub,
    Both,
}

/// Search input shared by manga and online stream providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    pub query: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub dub: bool,
}

impl SearchOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Shared HTTP client for provider requests
pub fn build_http_client(timeout_secs: u64, user_agent: &str) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .cookie_store(true)
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .user_agent(user_agent)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("manga".parse::<ProviderKind>(), Ok(ProviderKind::Manga));
        assert_eq!(
            "anime-torrent-provider".parse::<ProviderKind>(),
            Ok(ProviderKind::Torrent)
        );
        assert!("books".parse::<ProviderKind>().is_err());
        assert_eq!(ProviderKind::Onlinestream.to_string(), "onlinestream");
    }

    #[test]
    fn test_search_result_json() {
        let result = SearchResult {
            provider: "comick".to_string(),
            id: "x1".to_string(),
            title: "Title".to_string(),
            rating: 0.5,
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["searchRating"], 0.5);
        assert_eq!(json["synonyms"], serde_json::json!([]));
    }
}
