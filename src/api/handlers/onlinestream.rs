//! Online stream handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use crate::api::{AppError, AppState};
use crate::media::Media;
use crate::onlinestream::{EpisodeContainer, EpisodeSource};
use crate::provider::SearchResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodesRequest {
    pub provider: String,
    pub media: Media,
    #[serde(default)]
    pub dubbed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcesRequest {
    pub provider: String,
    pub media: Media,
    pub episode_number: i32,
    #[serde(default)]
    pub dubbed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRequest {
    pub provider: String,
    pub media_id: i32,
    pub anime_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveMappingRequest {
    pub provider: String,
    pub media_id: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub provider: String,
    pub query: String,
    #[serde(default)]
    pub dubbed: bool,
}

/// Episode list of a media; servers are only resolved by `sources`
pub async fn episodes(
    State(state): State<AppState>,
    Json(req): Json<EpisodesRequest>,
) -> Result<Json<EpisodeContainer>, AppError> {
    let container = state
        .onlinestream
        .get_episode_container(&req.provider, &req.media, 0, 0, req.dubbed)
        .await?;
    Ok(Json(container))
}

pub async fn sources(
    State(state): State<AppState>,
    Json(req): Json<SourcesRequest>,
) -> Result<Json<EpisodeSource>, AppError> {
    let source = state
        .onlinestream
        .get_episode_sources(&req.provider, &req.media, req.episode_number, req.dubbed)
        .await?;
    Ok(Json(source))
}

pub async fn set_mapping(
    State(state): State<AppState>,
    Json(req): Json<MappingRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.onlinestream.manual_mapping(&req.provider, req.media_id, &req.anime_id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn remove_mapping(
    State(state): State<AppState>,
    Json(req): Json<RemoveMappingRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.onlinestream.remove_mapping(&req.provider, req.media_id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Vec<SearchResult>>, AppError> {
    let results = state
        .onlinestream
        .manual_search(&req.provider, &req.query, req.dubbed)
        .await?;
    Ok(Json(results))
}

pub async fn empty_cache(
    State(state): State<AppState>,
    Path(media_id): Path<i32>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.onlinestream.empty_cache(media_id)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}
