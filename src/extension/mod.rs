//! Extension bank
//!
//! A registry of providers keyed by provider ID. Each entry is tagged with the
//! capability it was registered under, and lookups only see entries of the
//! requested capability. Readers take a snapshot of the whole map; writers
//! build a new map under a single mutex and swap it in, so a provider handed
//! out before `unregister` keeps working for whoever holds it.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::provider::manga::{
    ComicK, LocalProvider, Mangadex, COMICK_PROVIDER_ID, LOCAL_PROVIDER_ID, MANGADEX_PROVIDER_ID,
};
use crate::provider::onlinestream::{Gogoanime, GOGOANIME_PROVIDER_ID};
use crate::provider::torrent::{AnimeTosho, ANIMETOSHO_PROVIDER_ID};
use crate::provider::{
    MangaProvider, OnlinestreamProvider, ProviderKind, ProviderType, TorrentProvider,
};

pub const BUILTIN_MANIFEST_URI: &str = "builtin";

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("extension {id} is registered as {registered}, not {requested}")]
    KindMismatch {
        id: String,
        registered: ProviderKind,
        requested: ProviderKind,
    },

    #[error("invalid manifest {0}: {1}")]
    InvalidManifest(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExtensionError>;

/// Metadata an extension declares about itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "manifestURI")]
    pub manifest_uri: String,
    #[serde(default)]
    pub language: String,
    #[serde(default, rename = "type")]
    pub provider_type: ProviderType,
    pub kind: ProviderKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub lang: String,
    /// Built-in provider this manifest is an alias of; defaults to `id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
}

impl ExtensionManifest {
    pub(crate) fn builtin(id: &str, name: &str, kind: ProviderKind, website: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            manifest_uri: BUILTIN_MANIFEST_URI.to_string(),
            language: "rust".to_string(),
            provider_type: ProviderType::Main,
            kind,
            description: String::new(),
            author: String::new(),
            icon: String::new(),
            website: website.to_string(),
            lang: "en".to_string(),
            implementation: None,
        }
    }
}

/// A provider behind one of the three capability contracts
#[derive(Clone)]
pub enum ProviderHandle {
    Manga(Arc<dyn MangaProvider>),
    Onlinestream(Arc<dyn OnlinestreamProvider>),
    Torrent(Arc<dyn TorrentProvider>),
}

impl ProviderHandle {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderHandle::Manga(_) => ProviderKind::Manga,
            ProviderHandle::Onlinestream(_) => ProviderKind::Onlinestream,
            ProviderHandle::Torrent(_) => ProviderKind::Torrent,
        }
    }
}

#[derive(Clone)]
pub struct Extension {
    pub manifest: ExtensionManifest,
    pub handle: ProviderHandle,
}

type Snapshot = Arc<HashMap<String, Arc<Extension>>>;

pub struct ExtensionBank {
    snapshot: RwLock<Snapshot>,
    write: Mutex<()>,
}

impl Default for ExtensionBank {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionBank {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            write: Mutex::new(()),
        }
    }

    fn load(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    /// Edit a copy of the map and publish it. Nothing is published when `f` fails.
    fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut HashMap<String, Arc<Extension>>) -> Result<T>,
    {
        let _guard = self.write.lock();
        let mut next = (*self.load()).clone();
        let out = f(&mut next)?;
        *self.snapshot.write() = Arc::new(next);
        Ok(out)
    }

    /// Register or replace an extension under its manifest ID.
    ///
    /// The manifest kind must match the handle, and an ID keeps the kind it was
    /// first registered with.
    pub fn register(&self, manifest: ExtensionManifest, handle: ProviderHandle) -> Result<()> {
        if manifest.kind != handle.kind() {
            return Err(ExtensionError::KindMismatch {
                id: manifest.id,
                registered: handle.kind(),
                requested: manifest.kind,
            });
        }

        self.update(|map| {
            if let Some(existing) = map.get(&manifest.id) {
                if existing.manifest.kind != manifest.kind {
                    return Err(ExtensionError::KindMismatch {
                        id: manifest.id,
                        registered: existing.manifest.kind,
                        requested: manifest.kind,
                    });
                }
            }

            debug!(id = %manifest.id, kind = %manifest.kind, "extension: Registering");
            map.insert(manifest.id.clone(), Arc::new(Extension { manifest, handle }));
            Ok(())
        })
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self
            .update(|map| Ok(map.remove(id).is_some()))
            .unwrap_or(false);
        if removed {
            debug!(id, "extension: Unregistered");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Extension>> {
        self.load().get(id).cloned()
    }

    pub fn get_manga(&self, id: &str) -> Result<Arc<dyn MangaProvider>> {
        match self.get(id).map(|e| e.handle.clone()) {
            Some(ProviderHandle::Manga(p)) => Ok(p),
            _ => Err(ExtensionError::ProviderNotFound(id.to_string())),
        }
    }

    pub fn get_onlinestream(&self, id: &str) -> Result<Arc<dyn OnlinestreamProvider>> {
        match self.get(id).map(|e| e.handle.clone()) {
            Some(ProviderHandle::Onlinestream(p)) => Ok(p),
            _ => Err(ExtensionError::ProviderNotFound(id.to_string())),
        }
    }

    pub fn get_torrent(&self, id: &str) -> Result<Arc<dyn TorrentProvider>> {
        match self.get(id).map(|e| e.handle.clone()) {
            Some(ProviderHandle::Torrent(p)) => Ok(p),
            _ => Err(ExtensionError::ProviderNotFound(id.to_string())),
        }
    }

    /// Manifests of every registered extension, sorted by ID
    pub fn manifests(&self) -> Vec<ExtensionManifest> {
        let mut manifests: Vec<ExtensionManifest> =
            self.load().values().map(|e| e.manifest.clone()).collect();
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        manifests
    }

    /// Register every JSON manifest in `dir` as an alias of an already
    /// registered provider. Returns the number of aliases added.
    pub fn load_manifests(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load_manifest(&path) {
                Ok(id) => {
                    info!(id = %id, "extension: Loaded manifest");
                    count += 1;
                }
                Err(e) => warn!("extension: Skipping {:?}: {}", path, e),
            }
        }
        Ok(count)
    }

    fn load_manifest(&self, path: &Path) -> Result<String> {
        let name = path.display().to_string();
        let content = std::fs::read_to_string(path)?;
        let mut manifest: ExtensionManifest = serde_json::from_str(&content)
            .map_err(|e| ExtensionError::InvalidManifest(name.clone(), e.to_string()))?;

        let target = manifest
            .implementation
            .clone()
            .unwrap_or_else(|| manifest.id.clone());
        let base = self
            .get(&target)
            .filter(|e| e.manifest.manifest_uri == BUILTIN_MANIFEST_URI)
            .ok_or_else(|| {
                ExtensionError::InvalidManifest(name, format!("unknown implementation {}", target))
            })?;

        if manifest.manifest_uri.is_empty() {
            manifest.manifest_uri = path.display().to_string();
        }
        let id = manifest.id.clone();
        self.register(manifest, base.handle.clone())?;
        Ok(id)
    }
}

/// The providers compiled into the server
pub fn builtin_extensions(http: &reqwest::Client, local: Arc<LocalProvider>) -> Vec<Extension> {
    vec![
        Extension {
            manifest: ExtensionManifest::builtin(
                COMICK_PROVIDER_ID,
                "ComicK",
                ProviderKind::Manga,
                "https://comick.io",
            ),
            handle: ProviderHandle::Manga(Arc::new(ComicK::new(http.clone()))),
        },
        Extension {
            manifest: ExtensionManifest::builtin(
                MANGADEX_PROVIDER_ID,
                "Mangadex",
                ProviderKind::Manga,
                "https://mangadex.org",
            ),
            handle: ProviderHandle::Manga(Arc::new(Mangadex::new(http.clone()))),
        },
        Extension {
            manifest: ExtensionManifest {
                provider_type: ProviderType::Special,
                description: "Chapters from a local directory".to_string(),
                ..ExtensionManifest::builtin(LOCAL_PROVIDER_ID, "Local", ProviderKind::Manga, "")
            },
            handle: ProviderHandle::Manga(local),
        },
        Extension {
            manifest: ExtensionManifest::builtin(
                GOGOANIME_PROVIDER_ID,
                "Gogoanime",
                ProviderKind::Onlinestream,
                "https://anitaku.to",
            ),
            handle: ProviderHandle::Onlinestream(Arc::new(Gogoanime::new(http.clone()))),
        },
        Extension {
            manifest: ExtensionManifest::builtin(
                ANIMETOSHO_PROVIDER_ID,
                "AnimeTosho",
                ProviderKind::Torrent,
                "https://animetosho.org",
            ),
            handle: ProviderHandle::Torrent(Arc::new(AnimeTosho::new(http.clone()))),
        },
    ]
}

/// Register the built-in providers, then any manifests found in `dir`.
pub fn load_extensions(
    bank: &ExtensionBank,
    http: &reqwest::Client,
    local: Arc<LocalProvider>,
    dir: &Path,
) -> Result<()> {
    for ext in builtin_extensions(http, local) {
        bank.register(ext.manifest, ext.handle)?;
    }
    let aliases = bank.load_manifests(dir)?;
    info!(
        builtin = bank.manifests().len() - aliases,
        aliases, "extension: Extensions loaded"
    );
    Ok(())
}
