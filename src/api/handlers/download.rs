//! Chapter download and queue handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::{AppError, AppState};
use crate::db::QueueRecord;
use crate::manga::{DownloadChapterOptions, DownloadId, DownloadListItem, MediaDownloadData};
use crate::media::Media;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRequest {
    #[serde(default)]
    pub collection: Vec<Media>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteChaptersRequest {
    pub download_ids: Vec<DownloadId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResponse {
    pub active: bool,
    pub current: Option<DownloadId>,
    pub items: Vec<QueueRecord>,
}

/// Downloaded media without collection details
pub async fn list(State(state): State<AppState>) -> Json<Vec<DownloadListItem>> {
    Json(state.downloads.new_download_list(&[]))
}

pub async fn list_for_collection(
    State(state): State<AppState>,
    Json(req): Json<CollectionRequest>,
) -> Json<Vec<DownloadListItem>> {
    Json(state.downloads.new_download_list(&req.collection))
}

pub async fn media(
    State(state): State<AppState>,
    Path(media_id): Path<i32>,
) -> Result<Json<MediaDownloadData>, AppError> {
    Ok(Json(state.downloads.get_media_downloads(media_id, true).await?))
}

pub async fn download(
    State(state): State<AppState>,
    Json(opts): Json<DownloadChapterOptions>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.downloads.download_chapter(&opts).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn remove(
    State(state): State<AppState>,
    Json(req): Json<DeleteChaptersRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.download_ids.is_empty() {
        return Err(AppError::bad_request("No chapters given"));
    }
    state.downloads.delete_chapters(&req.download_ids).await?;
    Ok(Json(serde_json::json!({ "deleted": req.download_ids.len() })))
}

pub async fn queue(State(state): State<AppState>) -> Result<Json<QueueResponse>, AppError> {
    Ok(Json(QueueResponse {
        active: state.downloads.is_queue_active(),
        current: state.downloads.current_download(),
        items: state.downloads.get_chapter_download_queue()?,
    }))
}

pub async fn clear_queue(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.downloads.clear_all_chapter_download_queue()?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

pub async fn reset_errored(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let reset = state.downloads.reset_errored_chapter_download_queue()?;
    Ok(Json(serde_json::json!({ "reset": reset })))
}

pub async fn start(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.downloads.run_chapter_download_queue();
    Json(serde_json::json!({ "active": true }))
}

pub async fn stop(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.downloads.stop_chapter_download_queue()?;
    Ok(Json(serde_json::json!({ "active": false })))
}
