//! AnimeTosho JSON feed provider

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, trace};

use super::release;
use super::{
    info_hash_from_bytes, magnet_from_info_hash, AnimeTorrent, SmartSearchFilter,
    SmartSearchOptions, TorrentMedia, TorrentProvider, TorrentProviderSettings,
    TorrentSearchOptions, RESOLUTIONS,
};
use crate::provider::{ProviderError, ProviderType, Result};
use crate::utils::format_size;

pub const ANIMETOSHO_PROVIDER_ID: &str = "animetosho";

const FEED_URL: &str = "https://feed.animetosho.org/json";

/// Swarm counts above this are scraper glitches
const MAX_PEERS: u32 = 30000;

#[derive(Debug, Clone, Deserialize)]
struct FeedTorrent {
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    torrent_url: Option<String>,
    #[serde(default)]
    info_hash: Option<String>,
    #[serde(default)]
    magnet_uri: Option<String>,
    #[serde(default)]
    seeders: Option<u32>,
    #[serde(default)]
    leechers: Option<u32>,
    #[serde(default)]
    torrent_download_count: Option<u32>,
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    num_files: u32,
}

impl FeedTorrent {
    fn to_anime_torrent(&self, media: &TorrentMedia, confirmed: bool) -> AnimeTorrent {
        let info = release::parse(&self.title);
        let is_batch = self.num_files > 1;

        let mut episode_number = match info.episode_numbers.as_slice() {
            [single] => single.parse().unwrap_or(-1),
            _ => -1,
        };
        if !is_batch && episode_number == -1 && media.is_movie_or_single_episode() {
            episode_number = 1;
        }

        let date = DateTime::<Utc>::from_timestamp(self.timestamp, 0)
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();

        AnimeTorrent {
            name: self.title.clone(),
            date,
            size: self.total_size,
            formatted_size: format_size(self.total_size),
            seeders: self.seeders.unwrap_or_default(),
            leechers: self.leechers.unwrap_or_default(),
            download_count: self.torrent_download_count.unwrap_or_default(),
            link: self.link.clone(),
            download_url: self.torrent_url.clone().unwrap_or_default(),
            magnet_link: self.magnet_uri.clone().unwrap_or_default(),
            info_hash: self.info_hash.clone().unwrap_or_default(),
            resolution: info.resolution,
            is_batch,
            episode_number,
            release_group: info.release_group,
            provider: ANIMETOSHO_PROVIDER_ID.to_string(),
            is_best_release: false,
            confirmed,
        }
    }
}

pub struct AnimeTosho {
    http: reqwest::Client,
    feed_url: String,
}

impl AnimeTosho {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            feed_url: FEED_URL.to_string(),
        }
    }

    async fn fetch_torrents(&self, suffix: &str) -> Result<Vec<FeedTorrent>> {
        let url = format!("{}{}", self.feed_url, suffix);
        trace!("animetosho: Fetching {}", url);

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "failed to fetch torrents, {}",
                response.status()
            )));
        }

        let mut torrents: Vec<FeedTorrent> = response.json().await?;
        for t in &mut torrents {
            clamp_peers(t);
        }
        Ok(torrents)
    }

    async fn search_by_aid(&self, aid: i32, resolution: &str) -> Result<Vec<FeedTorrent>> {
        let q = escape(&format_common_query(resolution));
        self.fetch_torrents(&format!("?qx=1&order=size-d&aid={}&q={}", aid, q))
            .await
    }

    async fn search_by_eid(&self, eid: i32, resolution: &str) -> Result<Vec<FeedTorrent>> {
        let q = escape(&format_common_query(resolution));
        self.fetch_torrents(&format!("?qx=1&eid={}&q={}", eid, q))
            .await
    }

    /// Run every query concurrently; failed queries contribute nothing.
    async fn fetch_all(&self, suffixes: Vec<String>) -> Vec<FeedTorrent> {
        let results = join_all(suffixes.iter().map(|s| self.fetch_torrents(s))).await;
        results
            .into_iter()
            .zip(suffixes.iter())
            .flat_map(|(result, suffix)| match result {
                Ok(torrents) => torrents,
                Err(e) => {
                    debug!("animetosho: Query {} failed: {}", suffix, e);
                    Vec::new()
                }
            })
            .collect()
    }

    async fn smart_search_single_episode(
        &self,
        opts: &SmartSearchOptions,
    ) -> Result<Vec<AnimeTorrent>> {
        if opts.anidb_eid > 0 {
            debug!(eid = opts.anidb_eid, "animetosho: Searching by episode ID");
            let torrents = self.search_by_eid(opts.anidb_eid, &opts.resolution).await?;
            return Ok(torrents
                .iter()
                .filter(|t| t.num_files == 1)
                .map(|t| t.to_anime_torrent(&opts.media, true))
                .collect());
        }

        debug!("animetosho: Searching single episode by query");
        let suffixes = build_smart_search_queries(opts)
            .into_iter()
            .map(|q| format!("?only_tor=1&q={}&qx=1&filter[0][t]=nyaa_class", q))
            .collect();

        let single_movie = opts.media.is_movie && opts.media.episode_count == 1;
        let torrents = self
            .fetch_all(suffixes)
            .await
            .into_iter()
            .filter(|t| t.num_files <= 1 || single_movie)
            .map(|t| t.to_anime_torrent(&opts.media, false))
            .collect();
        Ok(dedupe_by_link(torrents))
    }

    async fn smart_search_batch(&self, opts: &SmartSearchOptions) -> Result<Vec<AnimeTorrent>> {
        if opts.anidb_aid > 0 {
            debug!(aid = opts.anidb_aid, "animetosho: Searching batches by anime ID");
            let mut torrents = self.search_by_aid(opts.anidb_aid, &opts.resolution).await?;

            // Movies and single episodes keep every listing
            if !opts.media.is_movie_or_single_episode() {
                let batches: Vec<FeedTorrent> = torrents
                    .iter()
                    .filter(|t| t.num_files > 1)
                    .cloned()
                    .collect();
                if !batches.is_empty() {
                    torrents = batches;
                }
            }

            if !torrents.is_empty() {
                return Ok(torrents
                    .iter()
                    .map(|t| t.to_anime_torrent(&opts.media, true))
                    .collect());
            }
        }

        debug!("animetosho: Searching batches by query");
        let suffixes = build_smart_search_queries(opts)
            .into_iter()
            .map(|q| format!("?only_tor=1&q={}&qx=1&filter[0][t]=nyaa_class&order=size-d", q))
            .collect();

        let single_movie = opts.media.is_movie && opts.media.episode_count == 1;
        let torrents = self
            .fetch_all(suffixes)
            .await
            .into_iter()
            .filter(|t| t.num_files != 1 || single_movie)
            .map(|t| t.to_anime_torrent(&opts.media, false))
            .collect();
        Ok(dedupe_by_link(torrents))
    }
}

fn clamp_peers(t: &mut FeedTorrent) {
    if t.seeders.is_some_and(|s| s > MAX_PEERS) {
        t.seeders = Some(0);
    }
    if t.leechers.is_some_and(|l| l > MAX_PEERS) {
        t.leechers = Some(0);
    }
}

fn escape(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn dedupe_by_link(torrents: Vec<AnimeTorrent>) -> Vec<AnimeTorrent> {
    let mut seen = HashSet::new();
    torrents
        .into_iter()
        .filter(|t| seen.insert(t.link.clone()))
        .collect()
}

/// Characters that change the meaning of a feed query
fn sanitize_title(title: &str) -> String {
    title.replace(['!', ':', '[', ']'], "")
}

/// `("1080" !"720" !"540" !"480")` for a resolution, empty without one.
fn format_common_query(resolution: &str) -> String {
    if resolution.is_empty() {
        return String::new();
    }
    let quality = resolution.trim_end_matches('p');
    let others: Vec<String> = RESOLUTIONS
        .iter()
        .filter(|r| **r != quality)
        .map(|r| format!("!\"{}\"", r))
        .collect();
    format!("(\"{}\" {})", quality, others.join(" "))
}

fn zeropad(n: i32) -> String {
    format!("{:02}", n)
}

/// `("01"|"e1") -S0`, empty when no episode is requested
fn build_episode_string(episode: i32) -> String {
    if episode == -1 {
        return String::new();
    }
    format!("(\"{}\"|\"e{}\") -S0", zeropad(episode), episode)
}

fn build_batch_group(media: &TorrentMedia) -> String {
    let last = zeropad(media.episode_count);
    format!(
        "(\"01 - {last}\"|\"01 ~ {last}\"|\"Batch\"|\"Complete\"|\"+ OVA\"|\"+ Specials\"|\"+ Special\"|\"Seasons\"|\"Parts\")"
    )
}

/// Title alternation with season variants, e.g.
/// `("attack on titan" | "shingeki no kyojin""attack on titan season 2" | ...)`
fn build_title_string(media: &TorrentMedia) -> String {
    let rom_title = sanitize_title(&media.romaji_title);
    let eng_title = media
        .english_title
        .as_deref()
        .map(sanitize_title)
        .unwrap_or_default();

    let mut season = 0;
    let mut titles = Vec::new();
    for title in media.all_titles() {
        let (s, cleaned) = release::extract_season_number(&title);
        if s != 0 {
            season = s;
        }
        if !cleaned.is_empty() {
            titles.push(sanitize_title(&cleaned));
        }
    }

    for synonym in &media.synonyms {
        let (s, _) = release::extract_season_number(synonym);
        if s != 0 && season == 0 {
            season = s;
        }
    }

    titles.push(rom_title.clone());
    if !eng_title.is_empty() {
        titles.push(eng_title.clone());
    }

    for title in [&rom_title, &eng_title] {
        let lower = title.to_lowercase();
        if season == 0 && lower.contains(" iii") {
            season = 3;
        }
        if season == 0 && lower.contains(" ii") {
            season = 2;
        }
    }

    for title in [&rom_title, &eng_title] {
        let parts: Vec<&str> = title.split(':').collect();
        if parts.len() > 1 && parts[0].len() > 8 {
            titles.push(parts[0].to_string());
        }
    }

    let mut cleaned: Vec<String> = Vec::new();
    for title in titles {
        let mut t = title
            .replace([':', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if season != 0 {
            t = t.replace(" iii", "").replace(" ii", "");
        }
        if !cleaned.contains(&t) {
            cleaned.push(t);
        }
    }

    let shortest = cleaned
        .iter()
        .min_by_key(|t| t.len())
        .cloned()
        .unwrap_or_default();

    let mut query = String::from("(");
    query.push_str(
        &cleaned
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" | "),
    );
    if season > 0 {
        query.push_str(&format!(
            "\"{s} season {n}\" | \"{s} season {p}\" | \"{s} s{n}\" | \"{s} s{p}\"",
            s = shortest,
            n = season,
            p = zeropad(season)
        ));
    }
    query.push(')');
    query
}

/// Escaped feed queries for a smart search, each also tried with ` -S0`.
fn build_smart_search_queries(opts: &SmartSearchOptions) -> Vec<String> {
    let media = &opts.media;
    let mut queries = Vec::new();

    if media.is_movie_or_single_episode() {
        let titles: Vec<String> = media.all_titles().iter().map(|t| sanitize_title(t)).collect();
        let mut q = format!("({})", titles.join(" | "));
        if !opts.resolution.is_empty() {
            q.push(' ');
            q.push_str(&opts.resolution);
        }
        queries.push(q);
    } else if !opts.batch {
        let mut q = build_title_string(media);
        let episodes = build_episode_string(opts.episode_number);
        if !episodes.is_empty() {
            q.push(' ');
            q.push_str(&episodes);
        }
        if !opts.resolution.is_empty() {
            q.push(' ');
            q.push_str(&opts.resolution);
        }

        if media.absolute_season_offset > 0 && opts.episode_number > 0 {
            let ep = opts.episode_number + media.absolute_season_offset;
            let mut absolute = release::parse(&media.romaji_title).title;
            absolute.push_str(&format!(" (\"{ep}\"|\"e{ep}\"|\"ep{ep}\")"));
            if !opts.resolution.is_empty() {
                absolute.push(' ');
                absolute.push_str(&opts.resolution);
            }
            let combined = format!("({}) | ({})", absolute, q);
            queries.push(q);
            queries.push(combined);
        } else {
            queries.push(q);
        }
    } else {
        let mut q = match &media.english_title {
            Some(eng) => format!("({} | {})", media.romaji_title, eng),
            None => format!("({})", media.romaji_title),
        };
        q.push(' ');
        q.push_str(&build_batch_group(media));
        if !opts.resolution.is_empty() {
            q.push(' ');
            q.push_str(&opts.resolution);
        }
        queries.push(q);
    }

    queries
        .into_iter()
        .flat_map(|q| [escape(&q), escape(&format!("{} -S0", q))])
        .collect()
}

#[async_trait]
impl TorrentProvider for AnimeTosho {
    async fn search(&self, opts: &TorrentSearchOptions) -> Result<Vec<AnimeTorrent>> {
        debug!(query = %opts.query, "animetosho: Searching for torrents");
        let suffix = format!(
            "?qx=1&q={}&filter[0][t]=nyaa_class&order=",
            escape(&sanitize_title(&opts.query))
        );
        let torrents = self.fetch_torrents(&suffix).await?;
        Ok(torrents
            .iter()
            .map(|t| t.to_anime_torrent(&opts.media, false))
            .collect())
    }

    async fn smart_search(&self, opts: &SmartSearchOptions) -> Result<Vec<AnimeTorrent>> {
        if opts.batch {
            self.smart_search_batch(opts).await
        } else {
            self.smart_search_single_episode(opts).await
        }
    }

    async fn get_torrent_info_hash(&self, torrent: &AnimeTorrent) -> Result<String> {
        if !torrent.info_hash.is_empty() {
            return Ok(torrent.info_hash.clone());
        }
        if torrent.download_url.is_empty() {
            return Err(ProviderError::NoSource);
        }

        debug!(name = %torrent.name, "animetosho: Computing info hash from torrent file");
        let response = self.http.get(&torrent.download_url).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "Status: {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        info_hash_from_bytes(&bytes)
    }

    async fn get_torrent_magnet_link(&self, torrent: &AnimeTorrent) -> Result<String> {
        if !torrent.magnet_link.is_empty() {
            return Ok(torrent.magnet_link.clone());
        }
        let info_hash = self.get_torrent_info_hash(torrent).await?;
        Ok(magnet_from_info_hash(&info_hash, &torrent.name))
    }

    async fn get_latest(&self) -> Result<Vec<AnimeTorrent>> {
        debug!("animetosho: Fetching latest torrents");
        let torrents = self
            .fetch_torrents("?qx=1&q=&filter[0][t]=nyaa_class&order=")
            .await?;
        let media = TorrentMedia::default();
        Ok(torrents
            .iter()
            .map(|t| t.to_anime_torrent(&media, false))
            .collect())
    }

    fn settings(&self) -> TorrentProviderSettings {
        TorrentProviderSettings {
            can_smart_search: true,
            smart_search_filters: vec![
                SmartSearchFilter::Batch,
                SmartSearchFilter::EpisodeNumber,
                SmartSearchFilter::Resolution,
            ],
            supports_adult: false,
            provider_type: ProviderType::Main,
        }
    }
}
