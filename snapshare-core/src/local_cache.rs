//! Local cache of downloaded (or just-uploaded) media files, keyed by remote
//! URL.
//!
//! Files live in the cache directory under a digest of their URL; metadata is
//! kept as a single JSON index in the [`KeyValueStore`]. An entry is only
//! served while it is younger than the TTL and its file still exists.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snapshare_model::remote_extension;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::ports::KeyValueStore;
use crate::transfer::BlobTransferClient;

/// Key of the metadata index in the key-value store.
pub const CACHE_INDEX_KEY: &str = "media-cache/index/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub local_path: PathBuf,
    pub cached_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Hex SHA-256 of the file contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl CacheEntry {
    pub fn new(local_path: PathBuf, cached_at: DateTime<Utc>) -> Self {
        Self {
            local_path,
            cached_at,
            width: None,
            height: None,
            hash: None,
        }
    }

    /// TTL check alone; file existence is checked by the store.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now.signed_duration_since(self.cached_at) < ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

pub struct LocalCacheStore {
    directory: PathBuf,
    ttl: TimeDelta,
    kv: Arc<dyn KeyValueStore>,
    index: DashMap<String, CacheEntry>,
    persist_lock: Mutex<()>,
    stats: CacheStats,
}

impl std::fmt::Debug for LocalCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCacheStore")
            .field("directory", &self.directory)
            .field("ttl", &self.ttl)
            .field("entries", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl LocalCacheStore {
    /// Open the cache rooted at `directory`, loading any persisted index.
    ///
    /// An unreadable index is logged and replaced by an empty one.
    pub async fn open(
        directory: impl Into<PathBuf>,
        ttl: Duration,
        kv: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;

        let mut index = DashMap::new();
        if let Some(raw) = kv.get(CACHE_INDEX_KEY).await? {
            match serde_json::from_slice::<BTreeMap<String, CacheEntry>>(&raw) {
                Ok(stored) => index.extend(stored),
                Err(e) => {
                    tracing::warn!(target: "transfer::cache", error = %e, "discarding unreadable cache index");
                }
            }
        }

        Ok(Self {
            directory,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            kv,
            index,
            persist_lock: Mutex::new(()),
            stats: CacheStats::default(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// A valid entry for `url`, or `None`. Invalid entries are evicted.
    pub async fn lookup(&self, url: &str) -> Option<CacheEntry> {
        let entry = match self.index.get(url) {
            Some(entry) => entry.value().clone(),
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if self.is_valid(&entry, Utc::now()).await {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "transfer::cache", url = %url, "evicting stale cache entry");
        if let Err(e) = self.evict_if_unchanged(url, &entry).await {
            tracing::warn!(target: "transfer::cache", url = %url, error = %e, "failed to evict stale cache entry");
        }
        None
    }

    /// Serve `url` from the cache, downloading it on a miss.
    pub async fn cache_remote(
        &self,
        url: &str,
        client: &BlobTransferClient,
    ) -> Result<CacheEntry> {
        if let Some(entry) = self.lookup(url).await {
            return Ok(entry);
        }
        let bytes = client.download(url).await?;
        self.store_bytes(url, &bytes).await
    }

    /// Cache a just-uploaded local file under its new remote URL so the
    /// uploader's preview never re-downloads it.
    pub async fn cache_local(&self, url: &str, source: &Path) -> Result<CacheEntry> {
        let bytes = tokio::fs::read(source).await?;
        self.store_bytes(url, &bytes).await
    }

    /// Write `bytes` into the cache directory and index them under `url`.
    /// Concurrent writes for the same URL are last-writer-wins.
    pub async fn store_bytes(&self, url: &str, bytes: &[u8]) -> Result<CacheEntry> {
        let local_path = self.directory.join(file_name_for(url));
        let staging = local_path.with_extension(format!(
            "{}.part",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &local_path).await?;

        let (width, height) = probe_dimensions(bytes).unzip();
        let entry = CacheEntry {
            local_path,
            cached_at: Utc::now(),
            width,
            height,
            hash: Some(hex::encode(Sha256::digest(bytes))),
        };
        self.record(url, entry.clone()).await?;
        Ok(entry)
    }

    /// Insert or overwrite the entry for `url`.
    pub async fn record(&self, url: &str, entry: CacheEntry) -> Result<()> {
        self.index.insert(url.to_string(), entry);
        self.persist().await
    }

    /// Drop the entry for `url` and delete its file. Missing entries are
    /// fine.
    pub async fn invalidate(&self, url: &str) -> Result<()> {
        let Some((_, entry)) = self.index.remove(url) else {
            return Ok(());
        };
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        remove_file_quietly(&entry.local_path).await;
        self.persist().await
    }

    /// Evict `expected` for `url`, unless a concurrent write has replaced it
    /// since it was read. Returns whether anything was evicted.
    async fn evict_if_unchanged(&self, url: &str, expected: &CacheEntry) -> Result<bool> {
        if self
            .index
            .remove_if(url, |_, current| current == expected)
            .is_none()
        {
            return Ok(false);
        }
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        remove_file_quietly(&expected.local_path).await;
        self.persist().await?;
        Ok(true)
    }

    /// Remove every expired or dangling entry. Returns how many were swept.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let snapshot: Vec<(String, CacheEntry)> = self
            .index
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut swept = 0;
        for (url, entry) in snapshot {
            if self.is_valid(&entry, now).await {
                continue;
            }
            if self.index.remove_if(&url, |_, current| *current == entry).is_some() {
                remove_file_quietly(&entry.local_path).await;
                swept += 1;
            }
        }

        if swept > 0 {
            self.stats
                .evictions
                .fetch_add(swept as u64, Ordering::Relaxed);
            self.persist().await?;
            tracing::info!(target: "transfer::cache", swept, "swept expired cache entries");
        }
        Ok(swept)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            entries: self.index.len(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    async fn is_valid(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        entry.is_fresh_at(now, self.ttl)
            && tokio::fs::try_exists(&entry.local_path)
                .await
                .unwrap_or(false)
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot: BTreeMap<String, CacheEntry> = self
            .index
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let raw = serde_json::to_vec(&snapshot)?;
        self.kv.set(CACHE_INDEX_KEY, &raw).await
    }
}

/// File name for a cached URL: digest of the URL plus its extension.
pub fn file_name_for(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    match remote_extension(url).ok().flatten() {
        Some(ext) => format!("{digest}.{ext}"),
        None => digest,
    }
}

fn probe_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(target: "transfer::cache", path = %path.display(), error = %e, "failed to remove cached file");
        }
    }
}
