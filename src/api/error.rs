//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::extension::ExtensionError;
use crate::filecache::CacheError;
use crate::manga::MangaError;
use crate::onlinestream::OnlinestreamError;
use crate::provider::ProviderError;

/// Application error type
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", err);
        Self::internal(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        Self::internal(format!("Database error: {}", err))
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        let status = match &err {
            ProviderError::NoResults
            | ProviderError::NoChapters
            | ProviderError::NoPages
            | ProviderError::NoEpisodes
            | ProviderError::NoSource => StatusCode::NOT_FOUND,
            ProviderError::NotSupported => StatusCode::BAD_REQUEST,
            ProviderError::HttpError(_)
            | ProviderError::InvalidResponse(_)
            | ProviderError::Extractor(_) => StatusCode::BAD_GATEWAY,
            ProviderError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!("Provider error: {}", err);
        }
        Self::new(status, err.to_string())
    }
}

impl From<ExtensionError> for AppError {
    fn from(err: ExtensionError) -> Self {
        match err {
            ExtensionError::ProviderNotFound(_) => Self::not_found(err.to_string()),
            ExtensionError::KindMismatch { .. } | ExtensionError::InvalidManifest(..) => {
                Self::bad_request(err.to_string())
            }
            ExtensionError::Io(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        tracing::error!("Cache error: {:?}", err);
        Self::internal(err.to_string())
    }
}

impl From<MangaError> for AppError {
    fn from(err: MangaError) -> Self {
        match err {
            MangaError::Provider(e) => e.into(),
            MangaError::Cache(e) => e.into(),
            MangaError::Store(e) => e.into(),
            MangaError::NoResults
            | MangaError::NoChapters
            | MangaError::ProviderNotFound(_)
            | MangaError::ChapterNotFound
            | MangaError::ChapterNotDownloaded => Self::not_found(err.to_string()),
            MangaError::NoTitlesProvided => Self::bad_request(err.to_string()),
            MangaError::IncompleteDownload { .. }
            | MangaError::Io(_)
            | MangaError::Serialization(_) => {
                tracing::error!("Manga error: {:?}", err);
                Self::internal(err.to_string())
            }
        }
    }
}

impl From<OnlinestreamError> for AppError {
    fn from(err: OnlinestreamError) -> Self {
        match err {
            OnlinestreamError::Provider(e) => e.into(),
            OnlinestreamError::Cache(e) => e.into(),
            OnlinestreamError::Store(e) => e.into(),
            OnlinestreamError::NoAnimeFound
            | OnlinestreamError::NoEpisodes
            | OnlinestreamError::NoEpisodeSource
            | OnlinestreamError::ProviderNotFound(_) => Self::not_found(err.to_string()),
        }
    }
}
