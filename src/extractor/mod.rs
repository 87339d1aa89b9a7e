//! Video source extractors
//!
//! Extractors turn an opaque embed URL into a list of playable sources.

mod gogocdn;
mod streamsb;

pub use gogocdn::GogoCdn;
pub use streamsb::StreamSb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::catch_panic;

#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("no source found")]
    NoSourceFound,

    #[error("extraction failed")]
    ExtractionFailed,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ExtractorError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VideoSourceType {
    Mp4,
    M3u8,
}

impl VideoSourceType {
    /// Guess the type from the source URL
    pub fn from_url(url: &str) -> Self {
        if url.contains(".m3u8") {
            VideoSourceType::M3u8
        } else {
            VideoSourceType::Mp4
        }
    }
}

impl std::fmt::Display for VideoSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoSourceType::Mp4 => write!(f, "mp4"),
            VideoSourceType::M3u8 => write!(f, "m3u8"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoSubtitle {
    pub url: String,
    pub language: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoSource {
    pub url: String,
    #[serde(rename = "type")]
    pub source_type: VideoSourceType,
    pub quality: String,
    #[serde(default)]
    pub subtitles: Vec<VideoSubtitle>,
}

impl VideoSource {
    pub fn new(url: impl Into<String>, source_type: VideoSourceType, quality: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source_type,
            quality: quality.into(),
            subtitles: Vec::new(),
        }
    }
}

#[async_trait]
pub trait VideoExtractor: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn extract(&self, uri: &str) -> Result<Vec<VideoSource>>;
}

/// Run an extractor, converting a panic into `ExtractionFailed`.
pub async fn extract_guarded(extractor: &dyn VideoExtractor, uri: &str) -> Result<Vec<VideoSource>> {
    catch_panic(extractor.name(), extractor.extract(uri))
        .await
        .unwrap_or(Err(ExtractorError::ExtractionFailed))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Panicking;

    #[async_trait]
    impl VideoExtractor for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn extract(&self, uri: &str) -> Result<Vec<VideoSource>> {
            let parts: Vec<&str> = uri.split('/').collect();
            Ok(vec![VideoSource::new(parts[10], VideoSourceType::Mp4, "default")])
        }
    }

    #[tokio::test]
    async fn test_panic_is_sanitized() {
        let err = extract_guarded(&Panicking, "https://example.com").await.unwrap_err();
        assert!(matches!(err, ExtractorError::ExtractionFailed));
        assert_eq!(err.to_string(), "extraction failed");
    }

    #[test]
    fn test_source_serialization() {
        let source = VideoSource::new("https://cdn/x.m3u8", VideoSourceType::from_url("https://cdn/x.m3u8"), "720p");
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["type"], "m3u8");
        assert_eq!(json["quality"], "720p");
    }
}
