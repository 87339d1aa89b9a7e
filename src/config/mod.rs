//! Configuration management module

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub manga: MangaSettings,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub extensions: ExtensionSettings,

    #[serde(skip)]
    config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MangaSettings {
    /// Root of the chapter download tree
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Directory scanned by the local manga provider
    #[serde(default)]
    pub local_dir: Option<PathBuf>,

    /// Delay before the queue hands the next item to the downloader
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Per-request timeout for provider and image requests
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionSettings {
    #[serde(default = "default_extensions_dir")]
    pub dir: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    43211
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/shiori.db")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./data/manga")
}

fn default_settle_delay() -> u64 {
    5
}

fn default_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36".to_string()
}

fn default_extensions_dir() -> PathBuf {
    PathBuf::from("./data/extensions")
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

impl Default for MangaSettings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            local_dir: None,
            settle_delay_secs: default_settle_delay(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            dir: default_extensions_dir(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            database: DatabaseSettings::default(),
            cache: CacheSettings::default(),
            manga: MangaSettings::default(),
            http: HttpSettings::default(),
            extensions: ExtensionSettings::default(),
            config_file: None,
        }
    }
}

impl Settings {
    /// Load settings from environment and config file
    pub fn load() -> Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut config_paths = vec![
            PathBuf::from("config.toml"),
            PathBuf::from("./data/config.toml"),
        ];
        if let Some(path) = dirs_config_path() {
            config_paths.push(path);
        }

        let mut settings = Settings::default();

        for path in config_paths.iter() {
            if path.exists() {
                settings = Self::load_from_file(path)?;
                settings.config_file = Some(path.clone());
                break;
            }
        }

        settings.apply_env_overrides();
        settings.ensure_dirs()?;

        Ok(settings)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("SHIORI_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SHIORI_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(path) = std::env::var("SHIORI_DATA_DIR") {
            self.database.path = PathBuf::from(path).join("shiori.db");
        }
        if let Ok(path) = std::env::var("SHIORI_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SHIORI_CACHE_DIR") {
            self.cache.dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SHIORI_DOWNLOAD_DIR") {
            self.manga.download_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SHIORI_LOCAL_MANGA_DIR") {
            self.manga.local_dir = Some(PathBuf::from(path));
        }
        if let Ok(timeout) = std::env::var("SHIORI_HTTP_TIMEOUT") {
            if let Ok(timeout) = timeout.parse() {
                self.http.timeout_secs = timeout;
            }
        }
        if let Ok(path) = std::env::var("SHIORI_EXTENSIONS_DIR") {
            self.extensions.dir = PathBuf::from(path);
        }
    }

    fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.database.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        std::fs::create_dir_all(&self.cache.dir).context("Failed to create cache directory")?;
        std::fs::create_dir_all(&self.manga.download_dir)
            .context("Failed to create download directory")?;
        Ok(())
    }

    /// Get the path to the config file (if loaded from file)
    pub fn config_path(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }
}

/// Get platform-specific config directory
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|p| p.join("shiori/config.toml"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/shiori/config.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|p| PathBuf::from(p).join("shiori/config.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}
