//! Bucketed on-disk key/value cache
//!
//! Each bucket is a directory under the cache root named after the bucket. Each key
//! is one file holding a record: magic, ttl, write timestamp, the key itself and a
//! JSON payload. Keys too long for a file name are stored under a digest.
//! Temporary buckets expire records after their TTL, permanent buckets never do.
//! A record that fails to decode is treated as absent.

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use sha1_smol::Sha1;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::utils::write_atomic;

const MAGIC: &[u8; 4] = b"SHRC";
const HEADER_LEN: usize = 4 + 8 + 8 + 4;
const RECORD_EXT: &str = "cache";

/// Longest encoded key used verbatim as a file name
const MAX_PLAIN_NAME: usize = 128;
/// Encoded key prefix kept in front of the digest of a long key
const HASHED_PREFIX: usize = 100;

/// Lifetime of chapter, page and episode records
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid bucket name: {0}")]
    InvalidBucket(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// A temporary bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    name: String,
    ttl: Duration,
}

impl Bucket {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// A bucket whose records never expire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentBucket {
    name: String,
}

impl PermanentBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Record {
    /// Zero for permanent records
    ttl_secs: u64,
    written_at: i64,
    key: String,
    payload: Vec<u8>,
}

impl Record {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.key.len() + self.payload.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.ttl_secs.to_le_bytes());
        buf.extend_from_slice(&self.written_at.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return None;
        }
        let ttl_secs = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let written_at = i64::from_le_bytes(bytes[12..20].try_into().ok()?);
        let key_len = u32::from_le_bytes(bytes[20..24].try_into().ok()?) as usize;
        let key_end = HEADER_LEN.checked_add(key_len).filter(|end| *end <= bytes.len())?;
        let key = std::str::from_utf8(&bytes[HEADER_LEN..key_end]).ok()?.to_string();
        Some(Self {
            ttl_secs,
            written_at,
            key,
            payload: bytes[key_end..].to_vec(),
        })
    }

    fn is_expired(&self, now: i64) -> bool {
        self.ttl_secs > 0 && now > self.written_at.saturating_add(self.ttl_secs as i64)
    }
}

/// File-backed cache rooted at a directory
pub struct FileCache {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock of a removed bucket unless someone still holds it
    fn forget_lock(&self, name: &str) {
        let mut locks = self.locks.lock();
        if locks.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(name);
        }
    }

    fn bucket_dir(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(CacheError::InvalidBucket(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    fn record_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        Ok(self
            .bucket_dir(bucket)?
            .join(format!("{}.{}", key_to_filename(key), RECORD_EXT)))
    }

    fn read_record(&self, bucket: &str, key: &str) -> Result<Option<Record>> {
        let path = self.record_path(bucket, key)?;
        let lock = self.bucket_lock(bucket);
        let _guard = lock.lock();

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match Record::decode(&bytes) {
            Some(record) if record.key == key => Ok(Some(record)),
            Some(_) => {
                debug!(bucket, key, "filecache: record belongs to another key, ignoring");
                Ok(None)
            }
            None => {
                debug!(bucket, key, "filecache: corrupted record, ignoring");
                Ok(None)
            }
        }
    }

    fn write_record(&self, bucket: &str, key: &str, ttl_secs: u64, payload: Vec<u8>) -> Result<()> {
        let dir = self.bucket_dir(bucket)?;
        let path = self.record_path(bucket, key)?;
        let record = Record {
            ttl_secs,
            written_at: chrono::Utc::now().timestamp(),
            key: key.to_string(),
            payload,
        };

        let lock = self.bucket_lock(bucket);
        let _guard = lock.lock();
        std::fs::create_dir_all(&dir)?;
        write_atomic(&path, &record.encode())?;
        Ok(())
    }

    fn delete_record(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.record_path(bucket, key)?;
        let lock = self.bucket_lock(bucket);
        let _guard = lock.lock();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn decode_payload<T: DeserializeOwned>(bucket: &str, key: &str, payload: &[u8]) -> Option<T> {
        match serde_json::from_slice(payload) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(bucket, key, "filecache: undecodable payload: {}", err);
                None
            }
        }
    }

    /// Read a value from a temporary bucket. Expired or corrupted records read as `None`.
    pub fn get<T: DeserializeOwned>(&self, bucket: &Bucket, key: &str) -> Result<Option<T>> {
        let Some(record) = self.read_record(bucket.name(), key)? else {
            return Ok(None);
        };
        if record.is_expired(chrono::Utc::now().timestamp()) {
            return Ok(None);
        }
        Ok(Self::decode_payload(bucket.name(), key, &record.payload))
    }

    pub fn set<T: Serialize>(&self, bucket: &Bucket, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        // A zero TTL would read as permanent
        let ttl_secs = bucket.ttl().as_secs().max(1);
        self.write_record(bucket.name(), key, ttl_secs, payload)
    }

    pub fn delete(&self, bucket: &Bucket, key: &str) -> Result<()> {
        self.delete_record(bucket.name(), key)
    }

    /// Every live record of a temporary bucket
    pub fn get_all<T: DeserializeOwned>(&self, bucket: &Bucket) -> Result<Vec<(String, T)>> {
        let dir = self.bucket_dir(bucket.name())?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let now = chrono::Utc::now().timestamp();
        let lock = self.bucket_lock(bucket.name());
        let _guard = lock.lock();

        let mut values = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(record) = std::fs::read(&path).ok().and_then(|bytes| Record::decode(&bytes)) else {
                continue;
            };
            if record.is_expired(now) {
                continue;
            }
            if let Some(value) = Self::decode_payload(bucket.name(), &record.key, &record.payload) {
                values.push((record.key, value));
            }
        }
        Ok(values)
    }

    /// Drop a whole bucket, temporary or permanent
    pub fn remove(&self, bucket_name: &str) -> Result<()> {
        let dir = self.bucket_dir(bucket_name)?;
        let lock = self.bucket_lock(bucket_name);
        let outcome = {
            let _guard = lock.lock();
            std::fs::remove_dir_all(&dir)
        };
        drop(lock);
        self.forget_lock(bucket_name);

        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_perm<T: DeserializeOwned>(
        &self,
        bucket: &PermanentBucket,
        key: &str,
    ) -> Result<Option<T>> {
        let Some(record) = self.read_record(bucket.name(), key)? else {
            return Ok(None);
        };
        Ok(Self::decode_payload(bucket.name(), key, &record.payload))
    }

    pub fn set_perm<T: Serialize>(&self, bucket: &PermanentBucket, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.write_record(bucket.name(), key, 0, payload)
    }

    pub fn delete_perm(&self, bucket: &PermanentBucket, key: &str) -> Result<()> {
        self.delete_record(bucket.name(), key)
    }

    /// Names of all buckets currently on disk
    pub fn bucket_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)?.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Remove every bucket whose name matches the predicate
    pub fn remove_all_by<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = 0;
        for name in self.bucket_names()? {
            if predicate(&name) {
                self.remove(&name)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete expired or undecodable temporary records. Permanent records are kept.
    pub fn prune_expired(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut pruned = 0;
        for bucket in self.bucket_names()? {
            pruned += self.prune_bucket(&bucket, now);
        }
        Ok(pruned)
    }

    /// A bucket removed while pruning simply has nothing left to prune.
    fn prune_bucket(&self, bucket: &str, now: i64) -> usize {
        let lock = self.bucket_lock(bucket);
        let _guard = lock.lock();

        let dir = self.root.join(bucket);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(bucket, "filecache: failed to read bucket: {}", err);
                return 0;
            }
        };

        let mut pruned = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let stale = match std::fs::read(&path) {
                Ok(bytes) => match Record::decode(&bytes) {
                    Some(record) => record.is_expired(now),
                    None => true,
                },
                Err(_) => continue,
            };
            if !stale {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => pruned += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("filecache: failed to prune {:?}: {}", path, err),
            }
        }
        pruned
    }
}

/// Keys are percent-encoded so every key maps to exactly one safe file name.
/// Long keys keep an encoded prefix followed by their SHA-1 digest.
fn key_to_filename(key: &str) -> String {
    let encoded = urlencoding::encode(key).replace('.', "%2E");
    if encoded.len() <= MAX_PLAIN_NAME {
        return encoded;
    }

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    // Percent-encoded text is ASCII, so any byte offset is a char boundary
    format!("{}~{}", &encoded[..HASHED_PREFIX], hasher.digest())
}
