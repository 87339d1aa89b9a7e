//! Torrent search handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use crate::api::{AppError, AppState};
use crate::provider::torrent::{AnimeTorrent, SmartSearchOptions, TorrentSearchOptions};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub provider: String,
    /// Use the provider's smart search instead of a plain query
    #[serde(default)]
    pub smart: bool,
    #[serde(flatten)]
    pub options: SmartSearchOptions,
}

pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Vec<AnimeTorrent>>, AppError> {
    let provider = state.bank.get_torrent(&req.provider)?;

    let torrents = if req.smart {
        if !provider.settings().can_smart_search {
            return Err(AppError::bad_request(format!(
                "{} does not support smart search",
                req.provider
            )));
        }
        provider.smart_search(&req.options).await?
    } else {
        if req.options.query.trim().is_empty() {
            return Err(AppError::bad_request("Query is required"));
        }
        let opts = TorrentSearchOptions {
            media: req.options.media,
            query: req.options.query,
        };
        provider.search(&opts).await?
    };

    Ok(Json(torrents))
}

pub async fn latest(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<Vec<AnimeTorrent>>, AppError> {
    let provider = state.bank.get_torrent(&provider)?;
    Ok(Json(provider.get_latest().await?))
}
