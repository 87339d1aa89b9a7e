//! Shiori - content retrieval core for a self-hosted anime and manga server
//!
//! Fetches manga chapters, online stream episodes and torrent listings from
//! third-party providers, caches them on disk and downloads chapter images
//! for offline reading.

pub mod api;
pub mod config;
pub mod db;
pub mod events;
pub mod extension;
pub mod extractor;
pub mod filecache;
pub mod manga;
pub mod media;
pub mod onlinestream;
pub mod provider;
pub mod proxy;
pub mod resolver;
pub mod utils;
