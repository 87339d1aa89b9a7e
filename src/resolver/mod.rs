//! Title resolution
//!
//! Turns a media entry into a provider-native ID: a stored mapping wins,
//! otherwise every usable title is searched and the best-rated hit is taken.

pub mod comparison;

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::MappingStore;
use crate::provider::{MangaProvider, SearchOptions, SearchResult};
use comparison::{find_best_match_with_sorensen_dice, is_mostly_latin};

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("no titles provided")]
    NoTitlesProvided,

    #[error("no results found")]
    NoResults,

    #[error("mapping store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ResolverError>;

pub struct TitleResolver {
    mappings: Arc<dyn MappingStore>,
}

impl TitleResolver {
    pub fn new(mappings: Arc<dyn MappingStore>) -> Self {
        Self { mappings }
    }

    /// Resolve the manga ID `provider` uses for `media_id`.
    pub async fn resolve_manga_id(
        &self,
        provider_id: &str,
        provider: &dyn MangaProvider,
        media_id: i32,
        titles: &[String],
        year: Option<i32>,
    ) -> Result<String> {
        if let Some(manga_id) = self.mappings.manga_mapping(provider_id, media_id)? {
            debug!(provider = provider_id, media_id, manga_id = %manga_id, "resolver: Using manual mapping");
            return Ok(manga_id);
        }

        let titles: Vec<&String> = titles.iter().filter(|t| is_mostly_latin(t)).collect();
        if titles.is_empty() {
            return Err(ResolverError::NoTitlesProvided);
        }

        let searches = titles.iter().map(|title| async move {
            let opts = SearchOptions {
                query: title.to_string(),
                year,
                dub: false,
            };
            (title, provider.search(&opts).await)
        });

        let mut results = Vec::new();
        for (title, outcome) in join_all(searches).await {
            match outcome {
                Ok(mut hits) => {
                    hydrate_search_ratings(&mut hits, title);
                    results.extend(hits);
                }
                Err(e) => warn!(provider = provider_id, query = %title, "resolver: Search failed: {}", e),
            }
        }

        for result in &mut results {
            result.provider = provider_id.to_string();
        }

        let best = best_search_result(&results).ok_or(ResolverError::NoResults)?;
        debug!(
            provider = provider_id,
            media_id,
            manga_id = %best.id,
            rating = best.rating,
            "resolver: Selected search result"
        );
        Ok(best.id.clone())
    }
}

/// Rate results against `query` when the provider left every rating at zero.
pub fn hydrate_search_ratings(results: &mut [SearchResult], query: &str) {
    if !results.iter().all(|r| r.rating == 0.0) {
        return;
    }
    for result in results.iter_mut() {
        let mut candidates = vec![result.title.as_str()];
        candidates.extend(result.synonyms.iter().map(String::as_str));
        if let Some(best) = find_best_match_with_sorensen_dice(query, &candidates) {
            result.rating = best.rating;
        }
    }
}

/// Highest rating wins; the first of equal ratings is kept.
pub fn best_search_result(results: &[SearchResult]) -> Option<&SearchResult> {
    results.iter().fold(None, |best: Option<&SearchResult>, r| match best {
        Some(b) if r.rating <= b.rating => Some(b),
        _ => Some(r),
    })
}
