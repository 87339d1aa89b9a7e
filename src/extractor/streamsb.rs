//! StreamSB extractor (HLS only)

use async_trait::async_trait;
use serde::Deserialize;

use super::{ExtractorError, Result, VideoExtractor, VideoSource, VideoSourceType};

const HOST: &str = "https://streamsss.net/sources50";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/83.0.4103.116 Safari/537.36";

const PAYLOAD_PREFIX: &str = "566d337678566f743674494a7c7c";
const PAYLOAD_SUFFIX: &str = "7c7c346b6767586d6934774855537c7c73747265616d7362/6565417268755339773461447c7c346133383438333436313335376136323337373433383634376337633465366534393338373136643732373736343735373237613763376334363733353737303533366236333463353333363534366137633763373337343732363536313664373336327c7c6b586c3163614468645a47617c7c73747265616d7362";

#[derive(Debug, Deserialize)]
struct SourcesResponse {
    stream_data: Option<StreamData>,
}

#[derive(Debug, Deserialize)]
struct StreamData {
    file: String,
}

pub struct StreamSb {
    http: reqwest::Client,
}

impl StreamSb {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

/// The video id sits after `/e/`, optionally followed by `.html`.
fn video_id(uri: &str) -> Option<&str> {
    let (_, id) = uri.split_once("/e/")?;
    let id = id.split(".html").next().unwrap_or(id);
    (!id.is_empty()).then_some(id)
}

fn sources_url(id: &str) -> String {
    let hex: String = id.bytes().map(|b| format!("{:02x}", b)).collect();
    format!("{}/{}{}{}", HOST, PAYLOAD_PREFIX, hex, PAYLOAD_SUFFIX)
}

/// Split a master playlist on stream entries; the first line after each tag is the variant URL.
fn parse_stream_variants(master: &str) -> Vec<VideoSource> {
    master
        .split("#EXT-X-STREAM-INF:")
        .filter(|block| block.contains("m3u8"))
        .filter_map(|block| {
            let url = block.lines().nth(1)?.trim();
            let resolution = block.split("RESOLUTION=").nth(1)?.split(',').next()?;
            let height = resolution.split('x').nth(1)?.trim();
            Some(VideoSource::new(url, VideoSourceType::M3u8, format!("{}p", height)))
        })
        .collect()
}

#[async_trait]
impl VideoExtractor for StreamSb {
    fn name(&self) -> &'static str {
        "streamsb"
    }

    async fn extract(&self, uri: &str) -> Result<Vec<VideoSource>> {
        let id = video_id(uri).ok_or(ExtractorError::ExtractionFailed)?;

        let response: SourcesResponse = self
            .http
            .get(sources_url(id))
            .header("watchsb", "sbstream")
            .header("User-Agent", USER_AGENT)
            .header("Referer", uri)
            .send()
            .await?
            .json()
            .await?;

        let stream = response.stream_data.ok_or(ExtractorError::NoSourceFound)?;

        let master = self.http.get(&stream.file).send().await?.text().await?;
        let mut sources = parse_stream_variants(&master);
        sources.push(VideoSource::new(
            stream.file.as_str(),
            VideoSourceType::from_url(&stream.file),
            "auto",
        ));

        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_id() {
        assert_eq!(video_id("https://streamsss.net/e/abc123.html"), Some("abc123"));
        assert_eq!(video_id("https://streamsss.net/e/abc123"), Some("abc123"));
        assert_eq!(video_id("https://streamsss.net/d/abc123"), None);
        assert_eq!(video_id("https://streamsss.net/e/"), None);
    }

    #[test]
    fn test_sources_url_hex_encodes_id() {
        let url = sources_url("ab");
        assert!(url.starts_with("https://streamsss.net/sources50/566d337678566f743674494a7c7c6162"));
        assert!(url.ends_with(PAYLOAD_SUFFIX));
    }

    #[test]
    fn test_parse_stream_variants() {
        let master = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1000,RESOLUTION=1920x1080,FRAME-RATE=23.974\n\
            https://cdn.example/1080/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=500,RESOLUTION=854x480\n\
            https://cdn.example/480/index.m3u8\n";

        let sources = parse_stream_variants(master);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].url, "https://cdn.example/1080/index.m3u8");
        assert_eq!(sources[0].quality, "1080p");
        assert_eq!(sources[1].quality, "480p");
    }
}
