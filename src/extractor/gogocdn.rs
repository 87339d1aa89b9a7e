//! GogoCDN embed extractor
//!
//! The embed page carries an encrypted token. The token and the episode id are
//! used to build an `encrypt-ajax.php` request whose response is an AES-256-CBC
//! encrypted JSON document listing the sources.

use aes::Aes256;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::debug;

use super::{ExtractorError, Result, VideoExtractor, VideoSource, VideoSourceType};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const KEY: &[u8; 32] = b"37911490979715163134003223491201";
const SECOND_KEY: &[u8; 32] = b"54674138327930866480207815084989";
const IV: &[u8; 16] = b"3134003223491201";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

static EPISODE_SCRIPT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script[data-name='episode']").unwrap());

static RESOLUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(RESOLUTION=)(.*)(\s*?)(\s.*)").unwrap());

#[derive(Debug, Deserialize)]
struct AjaxResponse {
    data: String,
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    file: String,
    #[serde(default)]
    label: String,
}

#[derive(Debug, Deserialize)]
struct SourcePayload {
    source: Option<Vec<SourceEntry>>,
    #[serde(default)]
    source_bk: Vec<SourceEntry>,
}

pub struct GogoCdn {
    http: reqwest::Client,
}

impl GogoCdn {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        Ok(self.http.get(url).send().await?.text().await?)
    }

    /// Expand one source URL. HLS masters are resolved into one source per variant.
    async fn url_to_sources(
        &self,
        url: &str,
        source: &[SourceEntry],
        backup: &[SourceEntry],
    ) -> Result<Vec<VideoSource>> {
        if url.contains(".m3u8") {
            let manifest = self.fetch_text(url).await?;
            let mut sources = parse_master_playlist(url, &manifest);
            sources.push(VideoSource::new(url, VideoSourceType::M3u8, "default"));
            return Ok(sources);
        }

        let mut sources = Vec::new();
        for entry in source.iter().filter(|s| s.file == url) {
            let label = entry.label.split(' ').next().unwrap_or_default();
            sources.push(VideoSource::new(url, VideoSourceType::Mp4, format!("{}p", label)));
        }
        for _ in backup.iter().filter(|s| s.file == url) {
            sources.push(VideoSource::new(url, VideoSourceType::Mp4, "backup"));
        }
        Ok(sources)
    }
}

fn encrypt(text: &str, key: &[u8; 32]) -> String {
    let cipher = Aes256CbcEnc::new(key.into(), IV.into());
    STANDARD.encode(cipher.encrypt_padded_vec_mut::<Pkcs7>(text.as_bytes()))
}

fn decrypt(data: &str, key: &[u8; 32]) -> Result<Vec<u8>> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|_| ExtractorError::ExtractionFailed)?;
    let cipher = Aes256CbcDec::new(key.into(), IV.into());
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&bytes)
        .map_err(|_| ExtractorError::ExtractionFailed)
}

/// Query string for the AJAX endpoint
fn encrypted_ajax_params(id: &str, script_value: &str) -> Result<String> {
    let token = decrypt(script_value, KEY)?;
    let token = String::from_utf8(token).map_err(|_| ExtractorError::ExtractionFailed)?;
    Ok(format!("id={}&alias={}", encrypt(id, KEY), token))
}

fn decrypt_ajax_data(data: &str) -> Result<SourcePayload> {
    let plain = decrypt(data, SECOND_KEY)?;
    serde_json::from_slice(&plain).map_err(|_| ExtractorError::ExtractionFailed)
}

fn script_value(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&EPISODE_SCRIPT)
        .next()
        .and_then(|el| el.value().attr("data-value"))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// One source per `RESOLUTION=` variant, relative to the master's directory.
fn parse_master_playlist(master_url: &str, manifest: &str) -> Vec<VideoSource> {
    let base = master_url
        .rfind('/')
        .map(|i| &master_url[..i])
        .unwrap_or(master_url);

    RESOLUTION
        .captures_iter(manifest)
        .filter_map(|caps| {
            let height = caps[2].split('x').nth(1)?.split(',').next()?.trim();
            let path = caps[4].trim();
            Some(VideoSource::new(
                format!("{}/{}", base, path),
                VideoSourceType::M3u8,
                format!("{}p", height),
            ))
        })
        .collect()
}

#[async_trait]
impl VideoExtractor for GogoCdn {
    fn name(&self) -> &'static str {
        "gogocdn"
    }

    async fn extract(&self, uri: &str) -> Result<Vec<VideoSource>> {
        let parsed = url::Url::parse(uri).map_err(|_| ExtractorError::ExtractionFailed)?;
        let id = parsed
            .query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();

        let page = self.fetch_text(uri).await?;
        let value = script_value(&page).unwrap_or_default();
        if value.is_empty() || id.is_empty() {
            debug!("gogocdn: script value or id not found");
            return Err(ExtractorError::ExtractionFailed);
        }

        let ajax_url = format!(
            "{}://{}/encrypt-ajax.php?{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default(),
            encrypted_ajax_params(&id, &value)?
        );

        let response: AjaxResponse = self
            .http
            .get(&ajax_url)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/json, text/javascript, */*; q=0.01")
            .send()
            .await?
            .json()
            .await?;

        let payload = decrypt_ajax_data(&response.data)?;
        let source = payload.source.ok_or(ExtractorError::NoSourceFound)?;

        let urls: Vec<String> = source
            .iter()
            .chain(payload.source_bk.iter())
            .map(|s| s.file.clone())
            .collect();

        let mut results = Vec::new();
        for url in &urls {
            match self.url_to_sources(url, &source, &payload.source_bk).await {
                Ok(sources) => results.extend(sources),
                Err(err) => debug!("gogocdn: skipping {}: {}", url, err),
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let encrypted = encrypt("MjA4NDU1", KEY);
        let decrypted = decrypt(&encrypted, KEY).unwrap();
        assert_eq!(decrypted, b"MjA4NDU1");

        // Wrong key fails padding or yields garbage, never the plaintext
        match decrypt(&encrypted, SECOND_KEY) {
            Ok(bytes) => assert_ne!(bytes, b"MjA4NDU1"),
            Err(err) => assert!(matches!(err, ExtractorError::ExtractionFailed)),
        }
    }

    #[test]
    fn test_ajax_params() {
        let script = encrypt("abc&refer=none", KEY);
        let params = encrypted_ajax_params("123", &script).unwrap();
        assert_eq!(params, format!("id={}&alias=abc&refer=none", encrypt("123", KEY)));
    }

    #[test]
    fn test_decrypt_ajax_data() {
        let json = r#"{"source":[{"file":"https://cdn/ep.1080.mp4","label":"1080 P"}],"source_bk":[{"file":"https://bk/ep.m3u8"}]}"#;
        let cipher = Aes256CbcEnc::new(SECOND_KEY.into(), IV.into());
        let data = STANDARD.encode(cipher.encrypt_padded_vec_mut::<Pkcs7>(json.as_bytes()));

        let payload = decrypt_ajax_data(&data).unwrap();
        let source = payload.source.unwrap();
        assert_eq!(source.len(), 1);
        assert_eq!(source[0].label, "1080 P");
        assert_eq!(payload.source_bk[0].file, "https://bk/ep.m3u8");
    }

    #[test]
    fn test_missing_source_array() {
        let cipher = Aes256CbcEnc::new(SECOND_KEY.into(), IV.into());
        let data = STANDARD.encode(cipher.encrypt_padded_vec_mut::<Pkcs7>(br#"{"track":[]}"#));
        let payload = decrypt_ajax_data(&data).unwrap();
        assert!(payload.source.is_none());
    }

    #[test]
    fn test_script_value() {
        let html = r#"<html><body><script data-name="episode" data-value="abc=="></script></body></html>"#;
        assert_eq!(script_value(html).as_deref(), Some("abc=="));
        assert_eq!(script_value("<html></html>"), None);
    }

    #[test]
    fn test_parse_master_playlist() {
        let manifest = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,NAME=\"360p\"\n\
            ep.1.360.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720,NAME=\"720p\"\n\
            ep.1.720.m3u8\n";

        let sources = parse_master_playlist("https://cdn.example/hls/abc/ep.1.m3u8", manifest);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].quality, "360p");
        assert_eq!(sources[0].url, "https://cdn.example/hls/abc/ep.1.360.m3u8");
        assert_eq!(sources[1].quality, "720p");
        assert_eq!(sources[1].source_type, VideoSourceType::M3u8);
    }
}
