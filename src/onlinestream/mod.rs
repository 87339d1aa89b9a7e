//! Online stream episodes
//!
//! Resolves a media entry to a provider anime, lists its episodes and collects
//! the video sources of every server the provider declares. Episode lists and
//! per-episode servers are cached for a week.

use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::MappingStore;
use crate::extension::{ExtensionBank, ExtensionError};
use crate::extractor::VideoSource;
use crate::filecache::{Bucket, CacheError, FileCache, DEFAULT_TTL};
use crate::media::Media;
use crate::provider::{
    EpisodeDetails, EpisodeServer, OnlinestreamProvider, ProviderError, SearchOptions, SearchResult,
};
use crate::resolver::comparison::find_best_match_with_levenshtein;

const EPISODE_LIST_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum OnlinestreamError {
    #[error("no anime found")]
    NoAnimeFound,

    #[error("no episodes found")]
    NoEpisodes,

    #[error("no source found for episode")]
    NoEpisodeSource,

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("mapping store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OnlinestreamError>;

impl From<ExtensionError> for OnlinestreamError {
    fn from(err: ExtensionError) -> Self {
        match err {
            ExtensionError::ProviderNotFound(id) | ExtensionError::KindMismatch { id, .. } => {
                OnlinestreamError::ProviderNotFound(id)
            }
            other => OnlinestreamError::ProviderNotFound(other.to_string()),
        }
    }
}

/// One episode with every server that answered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeData {
    pub provider: String,
    pub id: String,
    pub number: i32,
    pub title: String,
    pub servers: Vec<EpisodeServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeContainer {
    pub provider: String,
    /// Everything the provider lists, used to look up servers later
    pub provider_episode_list: Vec<EpisodeDetails>,
    /// Episodes in the requested range that have at least one server
    pub episodes: Vec<EpisodeData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerVideoSource {
    pub server: String,
    pub headers: HashMap<String, String>,
    #[serde(flatten)]
    pub source: VideoSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeSource {
    pub number: i32,
    pub video_sources: Vec<ServerVideoSource>,
}

fn episode_list_bucket(provider: &str, media_id: i32) -> Bucket {
    Bucket::new(
        format!("onlinestream_{}_episode-list_{}", provider, media_id),
        DEFAULT_TTL,
    )
}

fn episode_data_bucket(provider: &str, media_id: i32) -> Bucket {
    Bucket::new(
        format!("onlinestream_{}_episode-data_{}", provider, media_id),
        DEFAULT_TTL,
    )
}

type EpisodeListKey = (i32, String, bool);

pub struct OnlinestreamService {
    cache: Arc<FileCache>,
    bank: Arc<ExtensionBank>,
    mappings: Arc<dyn MappingStore>,
    episode_lists: Mutex<LruCache<EpisodeListKey, Vec<EpisodeDetails>>>,
}

impl OnlinestreamService {
    pub fn new(cache: Arc<FileCache>, bank: Arc<ExtensionBank>, mappings: Arc<dyn MappingStore>) -> Self {
        let capacity = NonZeroUsize::new(EPISODE_LIST_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache,
            bank,
            mappings,
            episode_lists: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Episode list of `media` plus the servers of episodes numbered `from..=to`.
    ///
    /// Passing `0, 0` only loads the list.
    pub async fn get_episode_container(
        &self,
        provider: &str,
        media: &Media,
        from: i32,
        to: i32,
        dubbed: bool,
    ) -> Result<EpisodeContainer> {
        debug!(provider, media_id = media.id, from, to, dubbed, "onlinestream: Getting episode container");

        let source = self.bank.get_onlinestream(provider)?;
        let episode_list = self.episode_list(provider, source.as_ref(), media, dubbed).await?;
        if episode_list.is_empty() {
            return Err(OnlinestreamError::NoEpisodes);
        }

        let data_bucket = episode_data_bucket(provider, media.id);
        let mut episodes = Vec::new();
        for details in episode_list.iter().filter(|e| e.number >= from && e.number <= to) {
            let key = format!("{}${}${}${}", media.id, provider, details.number, dubbed);

            if let Ok(Some(cached)) = self.cache.get::<EpisodeData>(&data_bucket, &key) {
                debug!(key = %key, "onlinestream: Episode servers cache HIT");
                episodes.push(cached);
                continue;
            }

            let servers = match episode_servers(source.as_ref(), details).await {
                Ok(servers) => servers,
                Err(e) => {
                    warn!(provider, episode = details.number, "onlinestream: Failed to get episode servers: {}", e);
                    continue;
                }
            };
            let episode = EpisodeData {
                provider: provider.to_string(),
                id: details.id.clone(),
                number: details.number,
                title: details.title.clone(),
                servers,
            };
            debug!(key = %key, servers = episode.servers.len(), "onlinestream: Found episode servers");
            if let Err(e) = self.cache.set(&data_bucket, &key, &episode) {
                warn!(key = %key, "onlinestream: Failed to cache episode servers: {}", e);
            }
            episodes.push(episode);
        }

        if from > 0 && to > 0 && episodes.is_empty() {
            return Err(OnlinestreamError::NoEpisodes);
        }

        Ok(EpisodeContainer {
            provider: provider.to_string(),
            provider_episode_list: episode_list,
            episodes,
        })
    }

    /// Just the provider's episode list
    pub async fn get_media_episodes(&self, provider: &str, media: &Media, dubbed: bool) -> Result<Vec<EpisodeDetails>> {
        Ok(self
            .get_episode_container(provider, media, 0, 0, dubbed)
            .await?
            .provider_episode_list)
    }

    /// Video sources of episode `number` across all servers.
    pub async fn get_episode_sources(
        &self,
        provider: &str,
        media: &Media,
        number: i32,
        dubbed: bool,
    ) -> Result<EpisodeSource> {
        let container = self.get_episode_container(provider, media, number, number, dubbed).await?;
        let episode = container
            .episodes
            .into_iter()
            .find(|e| e.number == number)
            .ok_or(OnlinestreamError::NoEpisodes)?;

        let video_sources = episode
            .servers
            .into_iter()
            .flat_map(|server| {
                let EpisodeServer {
                    server: name,
                    headers,
                    video_sources,
                    ..
                } = server;
                video_sources.into_iter().map(move |source| ServerVideoSource {
                    server: name.clone(),
                    headers: headers.clone(),
                    source,
                })
            })
            .collect();

        Ok(EpisodeSource { number, video_sources })
    }

    async fn episode_list(
        &self,
        provider: &str,
        source: &dyn OnlinestreamProvider,
        media: &Media,
        dubbed: bool,
    ) -> Result<Vec<EpisodeDetails>> {
        let lru_key = (media.id, provider.to_string(), dubbed);
        if let Some(list) = self.episode_lists.lock().get(&lru_key) {
            return Ok(list.clone());
        }

        let bucket = episode_list_bucket(provider, media.id);
        let key = format!("{}${}${}", media.id, provider, dubbed);
        let list = match self.cache.get::<Vec<EpisodeDetails>>(&bucket, &key) {
            Ok(Some(list)) => {
                debug!(key = %key, "onlinestream: Episode list cache HIT");
                list
            }
            _ => {
                let mut list = self.fetch_episode_list(provider, source, media, dubbed).await?;
                for episode in &mut list {
                    episode.provider = provider.to_string();
                }
                self.cache.set(&bucket, &key, &list)?;
                info!(provider, media_id = media.id, episodes = list.len(), "onlinestream: Fetched episode list");
                list
            }
        };

        self.episode_lists.lock().put(lru_key, list.clone());
        Ok(list)
    }

    async fn fetch_episode_list(
        &self,
        provider: &str,
        source: &dyn OnlinestreamProvider,
        media: &Media,
        dubbed: bool,
    ) -> Result<Vec<EpisodeDetails>> {
        let anime_id = match self.mappings.onlinestream_mapping(provider, media.id)? {
            Some(anime_id) => {
                debug!(provider, anime_id = %anime_id, "onlinestream: Using manual mapping");
                anime_id
            }
            None => {
                let results = search_titles(source, media, dubbed).await;
                best_search_result(&results, &media.titles)
                    .ok_or(OnlinestreamError::NoAnimeFound)?
                    .id
                    .clone()
            }
        };

        let episodes = source.find_episodes(&anime_id).await?;
        if episodes.is_empty() {
            return Err(OnlinestreamError::NoEpisodes);
        }
        Ok(episodes)
    }

    /// Point `media_id` at `anime_id` on `provider`.
    pub fn manual_mapping(&self, provider: &str, media_id: i32, anime_id: &str) -> Result<()> {
        self.empty_cache(media_id)?;
        self.mappings.set_onlinestream_mapping(provider, media_id, anime_id)?;
        info!(provider, media_id, anime_id, "onlinestream: Saved manual mapping");
        Ok(())
    }

    pub fn get_mapping(&self, provider: &str, media_id: i32) -> Result<Option<String>> {
        Ok(self.mappings.onlinestream_mapping(provider, media_id)?)
    }

    pub fn remove_mapping(&self, provider: &str, media_id: i32) -> Result<()> {
        self.empty_cache(media_id)?;
        self.mappings.delete_onlinestream_mapping(provider, media_id)?;
        Ok(())
    }

    pub async fn manual_search(&self, provider: &str, query: &str, dubbed: bool) -> Result<Vec<SearchResult>> {
        let source = self.bank.get_onlinestream(provider)?;
        let opts = SearchOptions {
            query: query.to_string(),
            year: None,
            dub: dubbed,
        };
        let mut results = source.search(&opts).await?;
        for result in &mut results {
            result.provider = provider.to_string();
        }
        Ok(results)
    }

    /// Drop every cached episode list and episode of `media_id`.
    pub fn empty_cache(&self, media_id: i32) -> Result<usize> {
        let suffix = format!("_{}", media_id);
        let removed = self
            .cache
            .remove_all_by(|name| name.starts_with("onlinestream_") && name.ends_with(&suffix))?;

        let mut lists = self.episode_lists.lock();
        let stale: Vec<EpisodeListKey> = lists
            .iter()
            .filter(|(key, _)| key.0 == media_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            lists.pop(&key);
        }

        debug!(media_id, removed, "onlinestream: Emptied cache");
        Ok(removed)
    }
}

/// Romaji title first; the English title only when that search fails.
async fn search_titles(source: &dyn OnlinestreamProvider, media: &Media, dubbed: bool) -> Vec<SearchResult> {
    let year = media.start_year;
    let search = |title: &str| {
        let opts = SearchOptions {
            query: title.replace(':', ""),
            year,
            dub: dubbed,
        };
        async move { source.search(&opts).await }
    };

    let Some(romaji) = media.romaji_title() else {
        return Vec::new();
    };
    match search(romaji).await {
        Ok(results) => results,
        Err(e) => {
            debug!(query = romaji, "onlinestream: Romaji search failed: {}", e);
            match media.english_title() {
                Some(english) => search(english).await.unwrap_or_default(),
                None => Vec::new(),
            }
        }
    }
}

/// Result whose title is closest to any of `titles`; the first wins ties.
pub fn best_search_result<'a>(results: &'a [SearchResult], titles: &[String]) -> Option<&'a SearchResult> {
    results
        .iter()
        .filter_map(|r| find_best_match_with_levenshtein(&r.title, titles).map(|m| (r, m.distance)))
        .fold(None, |best: Option<(&SearchResult, usize)>, (r, distance)| match best {
            Some((_, d)) if distance >= d => best,
            _ => Some((r, distance)),
        })
        .map(|(r, _)| r)
}

/// Ask every declared server for the episode; servers that fail are skipped.
async fn episode_servers(source: &dyn OnlinestreamProvider, episode: &EpisodeDetails) -> Result<Vec<EpisodeServer>> {
    let settings = source.settings();
    let lookups = settings
        .episode_servers
        .iter()
        .map(|server| async move { (server, source.find_episode_server(episode, server).await) });

    let mut servers = Vec::new();
    for (server, outcome) in join_all(lookups).await {
        match outcome {
            Ok(found) => servers.push(found),
            Err(e) => debug!(server = %server, episode = episode.number, "onlinestream: Server lookup failed: {}", e),
        }
    }

    if servers.is_empty() {
        return Err(OnlinestreamError::NoEpisodeSource);
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::extension::{ExtensionManifest, ProviderHandle};
    use crate::extractor::VideoSourceType;
    use crate::provider::{OnlinestreamProviderSettings, ProviderKind, Result as ProviderResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubStream {
        searches: Mutex<Vec<String>>,
        episode_fetches: AtomicUsize,
        episodes: i32,
    }

    impl StubStream {
        fn new(episodes: i32) -> Self {
            Self {
                searches: Mutex::new(Vec::new()),
                episode_fetches: AtomicUsize::new(0),
                episodes,
            }
        }
    }

    fn result(id: &str, title: &str) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[async_trait]
    impl OnlinestreamProvider for StubStream {
        async fn search(&self, opts: &SearchOptions) -> ProviderResult<Vec<SearchResult>> {
            self.searches.lock().push(opts.query.clone());
            match opts.query.as_str() {
                "Romaji Only" => Err(ProviderError::NoResults),
                "Re Zero" | "English Title" => Ok(vec![
                    result("rezero-movie", "Re:Zero Memory Snow"),
                    result("rezero", "Re Zero"),
                ]),
                _ => Err(ProviderError::NoResults),
            }
        }

        async fn find_episodes(&self, anime_id: &str) -> ProviderResult<Vec<EpisodeDetails>> {
            self.episode_fetches.fetch_add(1, Ordering::SeqCst);
            Ok((1..=self.episodes)
                .map(|n| EpisodeDetails {
                    provider: "upstream".to_string(),
                    id: format!("{}-episode-{}", anime_id, n),
                    number: n,
                    url: String::new(),
                    title: format!("Episode {}", n),
                })
                .collect())
        }

        async fn find_episode_server(&self, episode: &EpisodeDetails, server: &str) -> ProviderResult<EpisodeServer> {
            if server == "broken" || episode.number == 3 {
                return Err(ProviderError::NoSource);
            }
            Ok(EpisodeServer {
                provider: "stub".to_string(),
                server: server.to_string(),
                headers: HashMap::from([("Referer".to_string(), "https://stub".to_string())]),
                video_sources: vec![VideoSource::new(
                    format!("https://cdn/{}.m3u8", episode.id),
                    VideoSourceType::M3u8,
                    "1080p",
                )],
            })
        }

        fn settings(&self) -> OnlinestreamProviderSettings {
            OnlinestreamProviderSettings {
                episode_servers: vec!["main".to_string(), "broken".to_string(), "backup".to_string()],
                supports_dub: true,
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        provider: Arc<StubStream>,
        service: OnlinestreamService,
    }

    fn fixture(episodes: i32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path()).unwrap());
        let bank = Arc::new(ExtensionBank::new());
        let provider = Arc::new(StubStream::new(episodes));
        bank.register(
            ExtensionManifest::builtin("stub", "Stub", ProviderKind::Onlinestream, ""),
            ProviderHandle::Onlinestream(provider.clone()),
        )
        .unwrap();
        let service = OnlinestreamService::new(cache, bank, Arc::new(Database::in_memory().unwrap()));
        Fixture {
            _dir: dir,
            provider,
            service,
        }
    }

    fn media(titles: &[&str]) -> Media {
        Media {
            id: 21,
            titles: titles.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_best_search_result_lowest_distance() {
        let results = vec![result("a", "Re:Zero Memory Snow"), result("b", "Re Zero")];
        let titles = vec!["Re:Zero".to_string(), "Re Zero".to_string()];
        assert_eq!(best_search_result(&results, &titles).unwrap().id, "b");
        assert!(best_search_result(&[], &titles).is_none());
    }

    #[tokio::test]
    async fn test_colons_removed_from_query() {
        let f = fixture(2);
        let episodes = f.service.get_media_episodes("stub", &media(&["Re: Zero"]), false).await.unwrap();
        assert_eq!(episodes[0].id, "rezero-episode-1");
        assert_eq!(*f.provider.searches.lock(), vec!["Re Zero"]);
    }

    #[tokio::test]
    async fn test_english_fallback_and_list_cache() {
        let f = fixture(4);
        let m = media(&["Romaji Only", "English Title"]);

        let episodes = f.service.get_media_episodes("stub", &m, false).await.unwrap();
        assert_eq!(episodes.len(), 4);
        assert_eq!(episodes[0].id, "rezero-episode-1");
        assert_eq!(episodes[0].provider, "stub");
        assert_eq!(*f.provider.searches.lock(), vec!["Romaji Only", "English Title"]);

        f.service.get_media_episodes("stub", &m, false).await.unwrap();
        assert_eq!(f.provider.episode_fetches.load(Ordering::SeqCst), 1);

        // Dubbed lists are keyed separately
        f.service.get_media_episodes("stub", &m, true).await.unwrap();
        assert_eq!(f.provider.episode_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_episode_sources_skip_failed_servers() {
        let f = fixture(4);
        let sources = f
            .service
            .get_episode_sources("stub", &media(&["Re Zero"]), 2, false)
            .await
            .unwrap();
        assert_eq!(sources.number, 2);
        let servers: Vec<&str> = sources.video_sources.iter().map(|s| s.server.as_str()).collect();
        assert_eq!(servers, vec!["main", "backup"]);
        assert_eq!(sources.video_sources[0].source.url, "https://cdn/rezero-episode-2.m3u8");
        assert_eq!(sources.video_sources[0].headers["Referer"], "https://stub");
    }

    #[tokio::test]
    async fn test_episode_without_servers() {
        let f = fixture(4);
        let err = f
            .service
            .get_episode_sources("stub", &media(&["Re Zero"]), 3, false)
            .await
            .unwrap_err();
        assert!(matches!(err, OnlinestreamError::NoEpisodes));

        let container = f
            .service
            .get_episode_container("stub", &media(&["Re Zero"]), 1, 4, false)
            .await
            .unwrap();
        let numbers: Vec<i32> = container.episodes.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_mapping_overrides_search_and_empties_cache() {
        let f = fixture(1);
        let m = media(&["Re Zero"]);
        f.service.get_media_episodes("stub", &m, false).await.unwrap();

        f.service.manual_mapping("stub", 21, "mapped").unwrap();
        let episodes = f.service.get_media_episodes("stub", &m, false).await.unwrap();
        assert_eq!(episodes[0].id, "mapped-episode-1");
        assert_eq!(f.provider.searches.lock().len(), 1);
        assert_eq!(f.service.get_mapping("stub", 21).unwrap().as_deref(), Some("mapped"));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let f = fixture(1);
        let err = f
            .service
            .get_media_episodes("missing", &media(&["Re Zero"]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, OnlinestreamError::ProviderNotFound(_)));
    }
}
