//! Gogoanime HTML scraper

use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, warn};

use super::{EpisodeDetails, EpisodeServer, OnlinestreamProvider, OnlinestreamProviderSettings, DEFAULT_SERVER};
use crate::extractor::{extract_guarded, GogoCdn, StreamSb, VideoExtractor};
use crate::provider::{ProviderError, Result, SearchOptions, SearchResult, SubOrDub};

pub const GOGOANIME_PROVIDER_ID: &str = "gogoanime";

const BASE_URL: &str = "https://anitaku.to";
const AJAX_URL: &str = "https://ajax.gogocdn.net";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

const GOGOCDN_SERVER: &str = "gogocdn";
const VIDSTREAMING_SERVER: &str = "vidstreaming";
const STREAMSB_SERVER: &str = "streamsb";

macro_rules! selector {
    ($name:ident, $css:expr) => {
        static $name: LazyLock<Selector> = LazyLock::new(|| Selector::parse($css).unwrap());
    };
}

selector!(SEARCH_ITEM, ".last_episodes > ul > li");
selector!(SEARCH_LINK, "p.name > a");
selector!(EPISODE_PAGE, "#episode_page > li > a");
selector!(MOVIE_ID, "#movie_id");
selector!(ALIAS, "#alias");
selector!(EPISODE_ITEM, "#episode_related > li");
selector!(ANCHOR, "a");
selector!(EPISODE_NAME, "div.name");
selector!(VIDSTREAMING_LINK, ".anime_muti_link > ul > li.vidcdn > a");
selector!(GOGOCDN_IFRAME, "#load_anime > div > div > iframe");
selector!(STREAMSB_LINK, ".anime_muti_link > ul > li.streamsb > a");

/// Values needed to request the episode list
#[derive(Debug, Default, PartialEq)]
struct CategoryInfo {
    ep_start: String,
    ep_end: String,
    movie_id: String,
    alias: String,
}

pub struct Gogoanime {
    http: reqwest::Client,
    gogocdn: GogoCdn,
    streamsb: StreamSb,
}

impl Gogoanime {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            gogocdn: GogoCdn::new(http.clone()),
            streamsb: StreamSb::new(http.clone()),
            http,
        }
    }

    async fn get_html(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

fn search_url(opts: &SearchOptions) -> String {
    let query: String = url::form_urlencoded::byte_serialize(opts.query.as_bytes()).collect();
    let mut url = format!("{}/search.html?keyword={}", BASE_URL, query);
    if opts.dub {
        url.push_str("%20(Dub)");
    }
    url
}

fn parse_search(html: &str) -> Vec<SearchResult> {
    let document = Html::parse_document(html);
    document
        .select(&SEARCH_ITEM)
        .filter_map(|item| {
            let link = item.select(&SEARCH_LINK).next()?;
            let href = link.value().attr("href").unwrap_or_default();
            let title = link.text().collect::<String>().trim().to_string();
            let id = href.split('/').nth(2).unwrap_or_default().to_string();
            let sub_or_dub = if title.to_lowercase().contains("dub") {
                SubOrDub::Dub
            } else {
                SubOrDub::Sub
            };

            Some(SearchResult {
                provider: GOGOANIME_PROVIDER_ID.to_string(),
                id,
                title,
                sub_or_dub: Some(sub_or_dub),
                ..Default::default()
            })
        })
        .collect()
}

fn parse_category(html: &str) -> CategoryInfo {
    let document = Html::parse_document(html);
    let mut info = CategoryInfo::default();

    for page in document.select(&EPISODE_PAGE) {
        if info.ep_start.is_empty() {
            info.ep_start = page.value().attr("ep_start").unwrap_or_default().to_string();
        }
        info.ep_end = page.value().attr("ep_end").unwrap_or_default().to_string();
    }
    let value = |selector: &Selector| {
        document
            .select(selector)
            .next()
            .and_then(|e| e.value().attr("value"))
            .unwrap_or_default()
            .to_string()
    };
    info.movie_id = value(&MOVIE_ID);
    info.alias = value(&ALIAS);
    info
}

fn parse_episode_list(html: &str) -> Vec<EpisodeDetails> {
    let document = Html::parse_fragment(html);
    let mut episodes: Vec<EpisodeDetails> = document
        .select(&EPISODE_ITEM)
        .filter_map(|item| {
            let href = item.select(&ANCHOR).next()?.value().attr("href")?;
            let id = href.split('/').nth(1)?.trim().to_string();
            let name = item.select(&EPISODE_NAME).next()?.text().collect::<String>();
            let number = match name.trim().trim_start_matches("EP ").trim().parse::<i32>() {
                Ok(n) => n,
                Err(_) => {
                    debug!(episode_id = %id, "gogoanime: Failed to parse episode number");
                    return None;
                }
            };

            Some(EpisodeDetails {
                provider: GOGOANIME_PROVIDER_ID.to_string(),
                url: format!("{}/{}", BASE_URL, id),
                id,
                number,
                title: String::new(),
            })
        })
        .collect();
    episodes.sort_by_key(|e| e.number);
    episodes
}

/// Embed URL for a server on an episode page; protocol-relative links get https.
fn parse_embed_url(html: &str, server: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let (selector, attr) = match server {
        VIDSTREAMING_SERVER => (&*VIDSTREAMING_LINK, "data-video"),
        STREAMSB_SERVER => (&*STREAMSB_LINK, "data-video"),
        _ => (&*GOGOCDN_IFRAME, "src"),
    };
    let src = document.select(selector).next()?.value().attr(attr)?.trim();
    if src.is_empty() {
        return None;
    }
    Some(if src.starts_with("//") {
        format!("https:{}", src)
    } else {
        src.to_string()
    })
}

#[async_trait]
impl OnlinestreamProvider for Gogoanime {
    async fn search(&self, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        debug!(query = %opts.query, dubbed = opts.dub, "gogoanime: Searching anime");

        let html = self.get_html(&search_url(opts)).await?;
        let results = parse_search(&html);

        if results.is_empty() {
            warn!("gogoanime: No results found");
            return Err(ProviderError::NoResults);
        }

        debug!(count = results.len(), "gogoanime: Fetched anime");
        Ok(results)
    }

    async fn find_episodes(&self, anime_id: &str) -> Result<Vec<EpisodeDetails>> {
        debug!(anime_id, "gogoanime: Fetching episodes");

        let url = if anime_id.contains("gogoanime") {
            anime_id.to_string()
        } else {
            format!("{}/category/{}", BASE_URL, anime_id)
        };
        let info = parse_category(&self.get_html(&url).await?);

        let response = self
            .http
            .get(format!("{}/ajax/load-list-episode", AJAX_URL))
            .header("User-Agent", USER_AGENT)
            .query(&[
                ("ep_start", info.ep_start.as_str()),
                ("ep_end", info.ep_end.as_str()),
                ("id", info.movie_id.as_str()),
                ("alias", info.alias.as_str()),
                ("default_ep", "0"),
            ])
            .send()
            .await?
            .error_for_status()?;
        let episodes = parse_episode_list(&response.text().await?);

        if episodes.is_empty() {
            warn!(anime_id, "gogoanime: No episodes found");
            return Err(ProviderError::NoEpisodes);
        }

        debug!(count = episodes.len(), "gogoanime: Fetched episodes");
        Ok(episodes)
    }

    async fn find_episode_server(&self, episode: &EpisodeDetails, server: &str) -> Result<EpisodeServer> {
        let server = if server == DEFAULT_SERVER || server.is_empty() {
            GOGOCDN_SERVER
        } else {
            server
        };
        debug!(server, episode_id = %episode.id, "gogoanime: Fetching server sources");

        let episode_url = format!("{}/{}", BASE_URL, episode.id);
        let html = self.get_html(&episode_url).await?;
        let Some(embed) = parse_embed_url(&html, server) else {
            warn!(server, "gogoanime: No sources found");
            return Err(ProviderError::NoSource);
        };

        let extractor: &dyn VideoExtractor = match server {
            STREAMSB_SERVER => &self.streamsb,
            _ => &self.gogocdn,
        };
        let video_sources = extract_guarded(extractor, &embed).await?;

        let mut headers = HashMap::from([("Referer".to_string(), episode_url)]);
        if server == STREAMSB_SERVER {
            headers.insert("watchsb".to_string(), "streamsb".to_string());
            headers.insert("User-Agent".to_string(), USER_AGENT.to_string());
        }

        debug!(server, count = video_sources.len(), "gogoanime: Fetched server sources");
        Ok(EpisodeServer {
            provider: GOGOANIME_PROVIDER_ID.to_string(),
            server: server.to_string(),
            headers,
            video_sources,
        })
    }

    fn settings(&self) -> OnlinestreamProviderSettings {
        OnlinestreamProviderSettings {
            episode_servers: vec![GOGOCDN_SERVER.to_string(), VIDSTREAMING_SERVER.to_string()],
            supports_dub: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_url() {
        let mut opts = SearchOptions::new("one piece");
        assert_eq!(search_url(&opts), "https://anitaku.to/search.html?keyword=one+piece");
        opts.dub = true;
        assert!(search_url(&opts).ends_with("one+piece%20(Dub)"));
    }

    #[test]
    fn test_parse_search() {
        let html = r#"
            <div class="last_episodes"><ul>
                <li><p class="name"><a href="/category/one-piece" title="One Piece">One Piece</a></p></li>
                <li><p class="name"><a href="/category/one-piece-dub">One Piece (Dub)</a></p></li>
            </ul></div>"#;
        let results = parse_search(html);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "one-piece");
        assert_eq!(results[0].sub_or_dub, Some(SubOrDub::Sub));
        assert_eq!(results[1].title, "One Piece (Dub)");
        assert_eq!(results[1].sub_or_dub, Some(SubOrDub::Dub));
    }

    #[test]
    fn test_parse_category() {
        let html = r##"
            <ul id="episode_page">
                <li><a href="#" ep_start="0" ep_end="100">1-100</a></li>
                <li><a href="#" ep_start="100" ep_end="150">101-150</a></li>
            </ul>
            <input type="hidden" value="42" id="movie_id">
            <input type="hidden" value="one-piece" id="alias">"##;
        assert_eq!(
            parse_category(html),
            CategoryInfo {
                ep_start: "0".to_string(),
                ep_end: "150".to_string(),
                movie_id: "42".to_string(),
                alias: "one-piece".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_episode_list() {
        let html = r#"
            <ul id="episode_related">
                <li><a href=" /one-piece-episode-2"><div class="name"><span>RAW</span> EP 2</div></a></li>
                <li><a href=" /one-piece-episode-1"><div class="name">EP 1</div></a></li>
                <li><a href=" /one-piece-episode-x"><div class="name">EP special</div></a></li>
            </ul>"#;
        let episodes = parse_episode_list(html);
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].id, "one-piece-episode-1");
        assert_eq!(episodes[0].number, 1);
        assert_eq!(episodes[0].url, "https://anitaku.to/one-piece-episode-1");
    }

    #[test]
    fn test_parse_embed_url() {
        let html = r#"
            <div id="load_anime"><div><div><iframe src="//embtaku.pro/streaming.php?id=MTIz"></iframe></div></div></div>
            <div class="anime_muti_link"><ul>
                <li class="vidcdn"><a data-video="https://embtaku.pro/embedplus?id=MTIz">Vidstreaming</a></li>
            </ul></div>"#;
        assert_eq!(
            parse_embed_url(html, GOGOCDN_SERVER).as_deref(),
            Some("https://embtaku.pro/streaming.php?id=MTIz")
        );
        assert_eq!(
            parse_embed_url(html, VIDSTREAMING_SERVER).as_deref(),
            Some("https://embtaku.pro/embedplus?id=MTIz")
        );
        assert!(parse_embed_url(html, STREAMSB_SERVER).is_none());
    }
}
