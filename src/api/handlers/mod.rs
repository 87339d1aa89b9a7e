//! API request handlers

pub mod download;
pub mod events;
pub mod manga;
pub mod onlinestream;
pub mod torrent;

use axum::{extract::State, Json};
use serde_json::json;

use super::AppState;
use crate::extension::ExtensionManifest;

/// Health check endpoint
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Every registered extension, built-in and aliased
pub async fn extensions(State(state): State<AppState>) -> Json<Vec<ExtensionManifest>> {
    Json(state.bank.manifests())
}
