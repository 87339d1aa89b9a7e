//! Torrent provider contract and built-in providers

mod animetosho;
pub mod release;

pub use animetosho::{AnimeTosho, ANIMETOSHO_PROVIDER_ID};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ProviderError, ProviderType, Result};

/// Resolutions smart search understands, best first
pub const RESOLUTIONS: [&str; 4] = ["1080", "720", "540", "480"];

/// A torrent listing normalized across providers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnimeTorrent {
    pub name: String,
    /// RFC 3339
    pub date: String,
    pub size: u64,
    pub formatted_size: String,
    pub seeders: u32,
    pub leechers: u32,
    pub download_count: u32,
    pub link: String,
    pub download_url: String,
    pub magnet_link: String,
    pub info_hash: String,
    pub resolution: String,
    pub is_batch: bool,
    /// -1 when unknown
    pub episode_number: i32,
    pub release_group: String,
    pub provider: String,
    pub is_best_release: bool,
    /// Listing was matched by a database id rather than by title
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SmartSearchFilter {
    Batch,
    EpisodeNumber,
    Resolution,
    Query,
    BestReleases,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TorrentProviderSettings {
    pub can_smart_search: bool,
    pub smart_search_filters: Vec<SmartSearchFilter>,
    pub supports_adult: bool,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
}

/// The media a torrent search is run for
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TorrentMedia {
    pub id: i32,
    pub romaji_title: String,
    #[serde(default)]
    pub english_title: Option<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub episode_count: i32,
    /// Episodes aired by previous seasons, for absolute numbering
    #[serde(default)]
    pub absolute_season_offset: i32,
    #[serde(default)]
    pub is_movie: bool,
    #[serde(default)]
    pub is_adult: bool,
}

impl TorrentMedia {
    pub fn is_movie_or_single_episode(&self) -> bool {
        self.is_movie || self.episode_count == 1
    }

    /// Romaji, English and synonyms in that order
    pub fn all_titles(&self) -> Vec<String> {
        let mut titles = vec![self.romaji_title.clone()];
        titles.extend(self.english_title.iter().cloned());
        titles.extend(self.synonyms.iter().cloned());
        titles
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentSearchOptions {
    #[serde(default)]
    pub media: TorrentMedia,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartSearchOptions {
    pub media: TorrentMedia,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub batch: bool,
    #[serde(default = "default_episode_number")]
    pub episode_number: i32,
    #[serde(default)]
    pub resolution: String,
    #[serde(default, rename = "anidbAID")]
    pub anidb_aid: i32,
    #[serde(default, rename = "anidbEID")]
    pub anidb_eid: i32,
    #[serde(default)]
    pub best_releases: bool,
}

fn default_episode_number() -> i32 {
    -1
}

/// Torrent listing capability contract
#[async_trait]
pub trait TorrentProvider: Send + Sync {
    async fn search(&self, opts: &TorrentSearchOptions) -> Result<Vec<AnimeTorrent>>;

    async fn smart_search(&self, opts: &SmartSearchOptions) -> Result<Vec<AnimeTorrent>>;

    async fn get_torrent_info_hash(&self, torrent: &AnimeTorrent) -> Result<String>;

    async fn get_torrent_magnet_link(&self, torrent: &AnimeTorrent) -> Result<String>;

    async fn get_latest(&self) -> Result<Vec<AnimeTorrent>>;

    fn settings(&self) -> TorrentProviderSettings;
}

/// Compute the v1 info hash of a `.torrent` file.
pub fn info_hash_from_bytes(bytes: &[u8]) -> Result<String> {
    let torrent = lava_torrent::torrent::v1::Torrent::read_from_bytes(bytes)
        .map_err(|e| ProviderError::InvalidResponse(format!("invalid torrent file: {}", e)))?;
    Ok(torrent.info_hash())
}

pub fn magnet_from_info_hash(info_hash: &str, name: &str) -> String {
    if name.is_empty() {
        format!("magnet:?xt=urn:btih:{}", info_hash)
    } else {
        format!(
            "magnet:?xt=urn:btih:{}&dn={}",
            info_hash,
            urlencoding::encode(name)
        )
    }
}
