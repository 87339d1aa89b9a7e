//! HTTP API layer

mod error;
pub mod handlers;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::config::Settings;
use crate::db::Database;
use crate::events::BroadcastSink;
use crate::extension::ExtensionBank;
use crate::filecache::FileCache;
use crate::manga::{ChapterService, DownloadManager, PageService};
use crate::onlinestream::OnlinestreamService;
use crate::provider::manga::LocalProvider;
use crate::proxy::ImageProxy;

pub use error::AppError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub bank: Arc<ExtensionBank>,
    pub cache: Arc<FileCache>,
    pub local: Arc<LocalProvider>,
    pub events: Arc<BroadcastSink>,
    pub chapters: Arc<ChapterService>,
    pub pages: Arc<PageService>,
    pub downloads: Arc<DownloadManager>,
    pub onlinestream: Arc<OnlinestreamService>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        db: Arc<Database>,
        cache: Arc<FileCache>,
        bank: Arc<ExtensionBank>,
        local: Arc<LocalProvider>,
        proxy: Arc<dyn ImageProxy>,
        events: Arc<BroadcastSink>,
    ) -> Self {
        let download_dir = settings.manga.download_dir.clone();

        let chapters = Arc::new(ChapterService::new(
            cache.clone(),
            bank.clone(),
            db.clone(),
            &download_dir,
        ));
        let pages = Arc::new(PageService::new(
            cache.clone(),
            bank.clone(),
            proxy.clone(),
            &download_dir,
        ));
        let downloads = DownloadManager::new(
            cache.clone(),
            pages.clone(),
            db.clone(),
            proxy,
            events.clone(),
            &download_dir,
            Duration::from_secs(settings.manga.settle_delay_secs),
        );
        let onlinestream = Arc::new(OnlinestreamService::new(cache.clone(), bank.clone(), db));

        Self {
            settings,
            bank,
            cache,
            local,
            events,
            chapters,
            pages,
            downloads,
            onlinestream,
        }
    }
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Health check
        .route("/health", get(handlers::health))
        .route("/extensions", get(handlers::extensions))

        // Manga
        .route("/manga/chapters", post(handlers::manga::chapters))
        .route("/manga/pages", post(handlers::manga::pages))
        .route("/manga/search", post(handlers::manga::search))
        .route(
            "/manga/mapping",
            post(handlers::manga::set_mapping).delete(handlers::manga::remove_mapping),
        )
        .route("/manga/refresh", post(handlers::manga::refresh))
        .route("/manga/latest", post(handlers::manga::latest))
        .route("/manga/local-page/{*path}", get(handlers::manga::local_page))
        .route("/manga/local-source-page/{*path}", get(handlers::manga::local_source_page))

        // Downloads
        .route(
            "/manga/downloads",
            get(handlers::download::list).post(handlers::download::list_for_collection),
        )
        .route("/manga/downloads/{media_id}", get(handlers::download::media))
        .route(
            "/manga/download",
            post(handlers::download::download).delete(handlers::download::remove),
        )
        .route(
            "/manga/queue",
            get(handlers::download::queue).delete(handlers::download::clear_queue),
        )
        .route("/manga/queue/errored", post(handlers::download::reset_errored))
        .route("/manga/queue/start", post(handlers::download::start))
        .route("/manga/queue/stop", post(handlers::download::stop))

        // Online streaming
        .route("/onlinestream/episodes", post(handlers::onlinestream::episodes))
        .route("/onlinestream/sources", post(handlers::onlinestream::sources))
        .route(
            "/onlinestream/mapping",
            post(handlers::onlinestream::set_mapping).delete(handlers::onlinestream::remove_mapping),
        )
        .route("/onlinestream/search", post(handlers::onlinestream::search))
        .route("/onlinestream/cache/{media_id}", delete(handlers::onlinestream::empty_cache))

        // Torrents
        .route("/torrent/search", post(handlers::torrent::search))
        .route("/torrent/latest/{provider}", get(handlers::torrent::latest))

        // Events
        .route("/events", get(handlers::events::subscribe));

    Router::new()
        .nest("/api", api_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}
