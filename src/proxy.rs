//! Image fetching with provider-imposed headers

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Unexpected status {0} for {1}")]
    Status(u16, String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// The only I/O path used to fetch page images
#[async_trait]
pub trait ImageProxy: Send + Sync {
    async fn get_image(&self, url: &str, headers: &HashMap<String, String>) -> Result<Vec<u8>>;
}

/// Forwards requests through the shared HTTP client
pub struct HttpImageProxy {
    http: reqwest::Client,
}

impl HttpImageProxy {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn to_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        // Headers that are not valid HTTP are dropped
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

#[async_trait]
impl ImageProxy for HttpImageProxy {
    async fn get_image(&self, url: &str, headers: &HashMap<String, String>) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .headers(to_header_map(headers))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProxyError::Status(response.status().as_u16(), url.to_string()));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map() {
        let mut headers = HashMap::new();
        headers.insert("Referer".to_string(), "https://comick.io/".to_string());
        headers.insert("bad header".to_string(), "x".to_string());

        let map = to_header_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("referer").unwrap(), "https://comick.io/");
    }
}
