//! Manga chapter and page handlers

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, PathBuf};

use crate::api::{AppError, AppState};
use crate::manga::{ChapterContainer, LatestChapterNumber, PageContainer};
use crate::media::Media;
use crate::provider::SearchResult;
use crate::utils::{LimitedReader, RangeError, ReaderError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaptersRequest {
    pub provider: String,
    pub media_id: i32,
    #[serde(default)]
    pub titles: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagesRequest {
    pub provider: String,
    pub media_id: i32,
    pub chapter_id: String,
    /// Also return the width and height of every page
    #[serde(default)]
    pub double_page: bool,
    #[serde(default)]
    pub offline: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub provider: String,
    pub query: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRequest {
    pub provider: String,
    pub media_id: i32,
    pub manga_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveMappingRequest {
    pub provider: String,
    pub media_id: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    pub collection: Vec<Media>,
    /// Media ID to the provider whose chapters should be re-fetched
    #[serde(default)]
    pub selected_provider_map: HashMap<i32, String>,
}

pub async fn chapters(
    State(state): State<AppState>,
    Json(req): Json<ChaptersRequest>,
) -> Result<Json<ChapterContainer>, AppError> {
    let container = state
        .chapters
        .get_chapter_container(&req.provider, req.media_id, &req.titles, req.year)
        .await?;
    Ok(Json(container))
}

pub async fn pages(
    State(state): State<AppState>,
    Json(req): Json<PagesRequest>,
) -> Result<Json<PageContainer>, AppError> {
    let container = state
        .pages
        .get_page_container(&req.provider, req.media_id, &req.chapter_id, req.double_page, req.offline)
        .await?;
    Ok(Json(container))
}

pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Vec<SearchResult>>, AppError> {
    // Resolve first so an unknown provider is reported as such
    state.bank.get_manga(&req.provider)?;
    Ok(Json(state.chapters.manual_search(&req.provider, &req.query).await?))
}

pub async fn set_mapping(
    State(state): State<AppState>,
    Json(req): Json<MappingRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.chapters.manual_mapping(&req.provider, req.media_id, &req.manga_id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn remove_mapping(
    State(state): State<AppState>,
    Json(req): Json<RemoveMappingRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.chapters.delete_manga_mapping(&req.provider, req.media_id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .chapters
        .refresh_chapter_containers(&req.collection, &req.selected_provider_map)
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn latest(
    State(state): State<AppState>,
) -> Result<Json<HashMap<i32, Vec<LatestChapterNumber>>>, AppError> {
    Ok(Json(state.chapters.get_latest_chapter_numbers_map()?))
}

/// Serve a page image from the download directory, honouring `Range`.
pub async fn local_page(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let relative = PathBuf::from(&path);
    if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(AppError::bad_request("Invalid page path"));
    }
    let full = state.settings.manga.download_dir.join(&relative);
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let page = tokio::task::spawn_blocking(move || read_page_file(&full, range.as_deref()))
        .await
        .map_err(|e| AppError::internal(e.to_string()))??;

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::ACCEPT_RANGES, "bytes");
    builder = match page.range {
        Some((start, end)) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, page.total)),
        None => builder.status(StatusCode::OK),
    };
    builder
        .body(Body::from(page.bytes))
        .map_err(|e| AppError::internal(e.to_string()))
}

/// Serve a page of the local manga directory, reading inside archives when needed.
pub async fn local_source_page(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let bytes = state.local.read_page(&path).await?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .body(Body::from(bytes))
        .map_err(|e| AppError::internal(e.to_string()))
}

struct PageBytes {
    bytes: Vec<u8>,
    total: u64,
    range: Option<(u64, u64)>,
}

fn read_page_file(path: &std::path::Path, range: Option<&str>) -> Result<PageBytes, AppError> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::not_found("Page not found"));
        }
        Err(e) => return Err(AppError::internal(e.to_string())),
    };
    let total = file
        .seek(SeekFrom::End(0))
        .map_err(|e| AppError::internal(e.to_string()))?;

    let Some(range) = range else {
        file.rewind().map_err(|e| AppError::internal(e.to_string()))?;
        let mut bytes = Vec::with_capacity(total as usize);
        file.read_to_end(&mut bytes)
            .map_err(|e| AppError::internal(e.to_string()))?;
        return Ok(PageBytes {
            bytes,
            total,
            range: None,
        });
    };

    let mut reader = LimitedReader::from_range(file, range, total).map_err(|e| match e {
        RangeError::Reader(ReaderError::InvalidOffset) => {
            AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, e.to_string())
        }
        RangeError::Reader(ReaderError::InvalidWhence) => AppError::bad_request(e.to_string()),
        RangeError::Io(e) => AppError::internal(e.to_string()),
    })?;
    let start = reader.base();
    let mut bytes = Vec::with_capacity(reader.len() as usize);
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| AppError::internal(e.to_string()))?;
    let end = start + bytes.len().saturating_sub(1) as u64;

    Ok(PageBytes {
        bytes,
        total,
        range: Some((start, end)),
    })
}
