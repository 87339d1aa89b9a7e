//! Online stream provider contract and built-in providers

mod gogoanime;

pub use gogoanime::{Gogoanime, GOGOANIME_PROVIDER_ID};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Result, SearchOptions, SearchResult};
use crate::extractor::VideoSource;

pub const DEFAULT_SERVER: &str = "default";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeDetails {
    pub provider: String,
    pub id: String,
    pub number: i32,
    pub url: String,
    #[serde(default)]
    pub title: String,
}

/// Sources of one episode on one server, with the headers players must send
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeServer {
    pub provider: String,
    pub server: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub video_sources: Vec<VideoSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OnlinestreamProviderSettings {
    pub episode_servers: Vec<String>,
    pub supports_dub: bool,
}

/// Online stream capability contract
#[async_trait]
pub trait OnlinestreamProvider: Send + Sync {
    async fn search(&self, opts: &SearchOptions) -> Result<Vec<SearchResult>>;

    async fn find_episodes(&self, anime_id: &str) -> Result<Vec<EpisodeDetails>>;

    async fn find_episode_server(&self, episode: &EpisodeDetails, server: &str) -> Result<EpisodeServer>;

    fn settings(&self) -> OnlinestreamProviderSettings;
}
