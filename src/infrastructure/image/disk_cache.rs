//! Encoded image bytes persisted under a cache directory, one file per key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::ports::{CacheError, CacheResult};
use crate::infrastructure::config::{APP_NAME, APP_ORGANIZATION, APP_QUALIFIER};

/// Byte budget of the disk tier when the config does not say otherwise.
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 200 * 1024 * 1024;

const ENTRY_EXTENSION: &str = "img";

fn io_error(action: &str, target: &Path, e: &std::io::Error) -> CacheError {
    CacheError::IoError(format!("{action} {}: {e}", target.display()))
}

/// Sizes of the entries on disk, by file name.
#[derive(Default)]
struct Index {
    sizes: HashMap<String, u64>,
    total: u64,
}

impl Index {
    fn record(&mut self, name: String, size: u64) {
        if let Some(old) = self.sizes.insert(name, size) {
            self.total -= old;
        }
        self.total += size;
    }

    fn forget(&mut self, name: &str) {
        if let Some(old) = self.sizes.remove(name) {
            self.total -= old;
        }
    }
}

/// Disk tier. Writes land through a temp file and a rename, so a reader
/// sees either the old entry, the new one, or nothing.
pub struct DiskImageCache {
    dir: PathBuf,
    max_size: u64,
    index: Mutex<Index>,
}

impl DiskImageCache {
    /// Opens `dir`, creating it if needed, and indexes the entries already
    /// there. Trims at once if they exceed `max_size`.
    ///
    /// # Errors
    /// Returns `CacheError::IoError` if the directory cannot be created or listed.
    pub async fn new(dir: PathBuf, max_size: u64) -> CacheResult<Self> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create", &dir, &e))?;

        let mut index = Index::default();
        let mut listing = fs::read_dir(&dir)
            .await
            .map_err(|e| io_error("list", &dir, &e))?;
        while let Ok(Some(entry)) = listing.next_entry().await {
            let path = entry.path();
            if is_staging(&path) {
                // Left by a write that was interrupted.
                if let Err(e) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Could not remove staging file");
                }
                continue;
            }
            if let Some(name) = entry_name(&path)
                && let Ok(meta) = entry.metadata().await
            {
                index.record(name, meta.len());
            }
        }
        debug!(
            dir = %dir.display(),
            entries = index.sizes.len(),
            bytes = index.total,
            "Opened disk cache"
        );

        let cache = Self {
            dir,
            max_size,
            index: Mutex::new(index),
        };
        cache.trim().await;
        Ok(cache)
    }

    /// Opens the cache under the platform cache directory.
    ///
    /// # Errors
    /// Returns `CacheError::IoError` if the directory cannot be created or listed.
    pub async fn default_location(max_size: u64) -> CacheResult<Self> {
        Self::new(default_cache_dir(), max_size).await
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    /// Reads the entry for `key`. Unreadable entries count as misses.
    pub async fn get_bytes(&self, key: &CacheKey) -> Option<Bytes> {
        match fs::read(self.entry_path(key)).await {
            Ok(data) => {
                trace!(key = %key, size = data.len(), "Disk hit");
                Some(Bytes::from(data))
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Disk entry unreadable");
                }
                trace!(key = %key, "Disk miss");
                None
            }
        }
    }

    /// Stores `data` under `key`, replacing any previous entry.
    ///
    /// # Errors
    /// Returns `CacheError::IoError` if the entry cannot be written.
    pub async fn put_bytes(&self, key: &CacheKey, data: &[u8]) -> CacheResult<()> {
        let path = self.entry_path(key);
        let staging = self
            .dir
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4().simple()));

        if let Err(e) = write_file(&staging, data).await {
            let _ = fs::remove_file(&staging).await;
            return Err(io_error("write", &staging, &e));
        }
        if let Err(e) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(io_error("commit", &path, &e));
        }

        self.index.lock().record(key.to_string(), data.len() as u64);
        debug!(key = %key, size = data.len(), "Stored on disk");

        self.trim().await;
        Ok(())
    }

    /// Deletes the entry for `key`. Returns whether one existed.
    ///
    /// # Errors
    /// Returns `CacheError::IoError` if the entry exists but cannot be removed.
    pub async fn evict(&self, key: &CacheKey) -> CacheResult<bool> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.index.lock().forget(key.as_str());
                debug!(key = %key, "Evicted from disk");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.lock().forget(key.as_str());
                Ok(false)
            }
            Err(e) => Err(io_error("remove", &path, &e)),
        }
    }

    /// Deletes every entry.
    ///
    /// # Errors
    /// Returns `CacheError::IoError` if the directory cannot be listed.
    pub async fn clear(&self) -> CacheResult<()> {
        let mut listing = fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error("list", &self.dir, &e))?;

        while let Some(entry) = listing
            .next_entry()
            .await
            .map_err(|e| io_error("list", &self.dir, &e))?
        {
            let path = entry.path();
            let Some(name) = entry_name(&path) else {
                continue;
            };
            match fs::remove_file(&path).await {
                Ok(()) => {
                    self.index.lock().forget(&name);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Could not remove entry"),
            }
        }
        debug!("Disk tier cleared");
        Ok(())
    }

    /// Bytes currently stored.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.index.lock().total
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().sizes.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry file exists for `key`.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        fs::try_exists(self.entry_path(key))
            .await
            .unwrap_or(false)
    }

    /// Deletes least recently accessed entries until the tier is 10% under
    /// its budget.
    async fn trim(&self) {
        let total = self.current_size();
        if total <= self.max_size {
            return;
        }
        let goal = self.max_size - self.max_size / 10;

        let names: Vec<String> = self.index.lock().sizes.keys().cloned().collect();
        let mut candidates = Vec::with_capacity(names.len());
        for name in names {
            let path = self.dir.join(format!("{name}.{ENTRY_EXTENSION}"));
            let accessed = match fs::metadata(&path).await {
                Ok(meta) => meta
                    .accessed()
                    .or_else(|_| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH),
                Err(_) => SystemTime::UNIX_EPOCH,
            };
            candidates.push((accessed, name, path));
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut removed = 0usize;
        for (_, name, path) in candidates {
            if self.current_size() <= goal {
                break;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    self.index.lock().forget(&name);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.index.lock().forget(&name);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Could not trim entry"),
            }
        }
        debug!(
            removed,
            bytes = self.current_size(),
            budget = self.max_size,
            "Trimmed disk tier"
        );
    }
}

/// Key part of an entry file name, `None` for staging and foreign files.
fn entry_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    (!stem.starts_with('.')).then(|| stem.to_owned())
}

fn is_staging(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') && name.ends_with(".tmp"))
}

async fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await
}

/// Platform cache directory for image entries.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME).map_or_else(
        || std::env::temp_dir().join(APP_NAME).join("images"),
        |dirs| dirs.cache_dir().join("images"),
    )
}
