//! Shiori server entry point

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use shiori::api::{self, AppState};
use shiori::config::Settings;
use shiori::db::Database;
use shiori::events::BroadcastSink;
use shiori::extension::{load_extensions, ExtensionBank};
use shiori::filecache::FileCache;
use shiori::provider::build_http_client;
use shiori::provider::manga::LocalProvider;
use shiori::proxy::HttpImageProxy;

/// Every hour, on the hour
const PRUNE_SCHEDULE: &str = "0 0 * * * *";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Shiori v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!("Configuration loaded from {:?}", settings.config_path());

    // Initialize database
    let db = Database::new(&settings.database.path)?;
    db.migrate()?;
    info!("Database initialized at {:?}", settings.database.path);

    let cache = Arc::new(FileCache::new(&settings.cache.dir).context("Failed to open file cache")?);
    let http = build_http_client(settings.http.timeout_secs, &settings.http.user_agent)
        .context("Failed to build HTTP client")?;

    // Register providers
    let local = Arc::new(LocalProvider::new(settings.manga.local_dir.clone()));
    let bank = Arc::new(ExtensionBank::new());
    load_extensions(&bank, &http, local.clone(), &settings.extensions.dir)?;

    let state = AppState::new(
        settings.clone(),
        Arc::new(db),
        cache.clone(),
        bank,
        local,
        Arc::new(HttpImageProxy::new(http)),
        Arc::new(BroadcastSink::default()),
    );
    state.downloads.start();

    let _scheduler = schedule_cache_pruning(cache).await?;

    // Build router
    let app = api::create_router(state);

    // Start server
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shiori=info,tower_http=info".into());

    let json = std::env::var("SHIORI_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Drop expired temporary cache records in the background.
async fn schedule_cache_pruning(cache: Arc<FileCache>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(PRUNE_SCHEDULE, move |_id, _scheduler| {
        let cache = cache.clone();
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || cache.prune_expired()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => info!(removed, "filecache: Pruned expired records"),
                Ok(Err(e)) => error!("filecache: Pruning failed: {}", e),
                Err(e) => error!("filecache: Pruning task failed: {}", e),
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    Ok(scheduler)
}
