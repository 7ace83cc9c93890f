//! Disk-backed LRU cache for fetched media bytes.
//!
//! Each entry lives under `<dir>/<shard>/<sha256(key)>` as a `.bin` data file
//! and a `.json` sidecar. Writes land in a temp file and are renamed into
//! place, so readers see either the previous complete entry or nothing.
//! Disk failures never escape: they degrade to misses and are logged.

use crate::error::CacheIoError;
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use walkdir::WalkDir;

const DATA_EXT: &str = "bin";
const META_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";

/// Metadata for a cached entry. Also the on-disk sidecar format.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    key: String,
    content_type: String,
    size: u64,
    last_access: DateTime<Utc>,
}

/// Bytes served from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMedia {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Result of [`ContentCache::put`].
#[derive(Debug)]
pub enum CacheWriteOutcome {
    /// Entry written. Lists keys evicted to make room.
    Stored { evicted: Vec<String> },
    /// Another writer holds this key; nothing was written.
    InFlight,
    /// Entry alone exceeds capacity and was not cached.
    TooLarge,
    /// Disk write failed; the key stays a miss.
    Degraded(CacheIoError),
}

impl CacheWriteOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, CacheWriteOutcome::Stored { .. })
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub item_count: usize,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
}

struct CacheState {
    /// LRU order of committed entries.
    lru: LruCache<String, CacheEntry>,
    /// Bytes of committed entries.
    committed: u64,
    /// Bytes reserved by writes in progress.
    reserved: u64,
    /// Keys being written or deleted. Reads treat them as misses.
    busy: HashSet<String>,
}

/// Size-bounded content cache shared by the preloader and on-demand loads.
pub struct ContentCache {
    cache_dir: PathBuf,
    capacity: u64,
    low_water: u64,
    state: Mutex<CacheState>,
}

impl ContentCache {
    /// Open (or create) a cache in `cache_dir`.
    ///
    /// Existing entries are restored in last-access order; partial writes and
    /// files without a sidecar are removed.
    pub fn new(cache_dir: PathBuf, capacity: u64, low_water_ratio: f64) -> Result<Self> {
        fs::create_dir_all(&cache_dir).context("Failed to create cache directory")?;

        let low_water = ((capacity as f64) * low_water_ratio.clamp(0.0, 1.0)) as u64;
        let cache = Self {
            cache_dir,
            capacity,
            low_water,
            state: Mutex::new(CacheState {
                lru: LruCache::unbounded(),
                committed: 0,
                reserved: 0,
                busy: HashSet::new(),
            }),
        };

        let evicted = cache.scan_existing();
        for key in evicted {
            cache.remove_files_sync(&key);
            cache.lock().busy.remove(&key);
        }

        let stats = cache.stats();
        tracing::info!(
            "Cache initialized: {} items, {:.2} MB / {:.2} MB used",
            stats.item_count,
            stats.total_bytes as f64 / 1024.0 / 1024.0,
            capacity as f64 / 1024.0 / 1024.0
        );

        Ok(cache)
    }

    /// Scan the cache directory and populate the index. Returns keys evicted
    /// because the restored set exceeded capacity.
    fn scan_existing(&self) -> Vec<String> {
        let mut restored = Vec::new();

        for entry in WalkDir::new(&self.cache_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(META_EXT) => {
                    if let Some(meta) = read_sidecar(path) {
                        let data = path.with_extension(DATA_EXT);
                        let on_disk = fs::metadata(&data).map(|m| m.len()).ok();
                        if on_disk == Some(meta.size) && data == self.data_path(&meta.key) {
                            restored.push(meta);
                            continue;
                        }
                    }
                    tracing::debug!("Dropping stale cache sidecar {:?}", path);
                    let _ = fs::remove_file(path);
                    let _ = fs::remove_file(path.with_extension(DATA_EXT));
                }
                Some(DATA_EXT) => {
                    if !path.with_extension(META_EXT).exists() {
                        tracing::debug!("Removing orphaned cache file {:?}", path);
                        let _ = fs::remove_file(path);
                    }
                }
                _ => {
                    tracing::debug!("Removing leftover cache file {:?}", path);
                    let _ = fs::remove_file(path);
                }
            }
        }

        restored.sort_by(|a, b| a.last_access.cmp(&b.last_access));

        let mut state = self.lock();
        for meta in restored {
            state.committed += meta.size;
            state.lru.put(meta.key.clone(), meta);
        }
        if state.committed > self.capacity {
            self.evict_locked(&mut state, 0)
        } else {
            Vec::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hashed_name(key: &str) -> String {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }

    /// Data file for `key`. Sidecar and temp files share its stem.
    fn data_path(&self, key: &str) -> PathBuf {
        let name = Self::hashed_name(key);
        self.cache_dir
            .join(&name[..2])
            .join(format!("{}.{}", name, DATA_EXT))
    }

    /// Look up `key`. A hit promotes the entry to most recently used and
    /// records the access in its sidecar, so the order survives a restart.
    pub async fn get(&self, key: &str) -> Option<CachedMedia> {
        let (path, entry) = {
            let mut state = self.lock();
            if state.busy.contains(key) {
                return None;
            }
            let entry = state.lru.get_mut(key)?;
            entry.last_access = Utc::now();
            (self.data_path(key), entry.clone())
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                self.touch_sidecar(&path, &entry).await;
                Some(CachedMedia {
                    bytes: Bytes::from(bytes),
                    content_type: entry.content_type,
                })
            }
            Err(source) => {
                let err = CacheIoError::Read { path, source };
                tracing::warn!("Cache read failed, treating as miss: {}", err);
                let mut state = self.lock();
                if !state.busy.contains(key) {
                    if let Some(entry) = state.lru.pop(key) {
                        state.committed = state.committed.saturating_sub(entry.size);
                    }
                }
                None
            }
        }
    }

    /// Store `bytes` under `key`, evicting least recently used entries first
    /// when the write would exceed capacity.
    pub async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> CacheWriteOutcome {
        let size = bytes.len() as u64;
        if size > self.capacity {
            tracing::warn!(
                "Not caching {} ({} bytes exceeds capacity {})",
                key,
                size,
                self.capacity
            );
            return CacheWriteOutcome::TooLarge;
        }

        let evicted = {
            let mut state = self.lock();
            if !state.busy.insert(key.to_string()) {
                tracing::debug!("Skipping put for {}: write already in flight", key);
                return CacheWriteOutcome::InFlight;
            }
            if let Some(old) = state.lru.pop(key) {
                state.committed = state.committed.saturating_sub(old.size);
            }
            let evicted = if state.committed + state.reserved + size > self.capacity {
                self.evict_locked(&mut state, size)
            } else {
                Vec::new()
            };
            state.reserved += size;
            evicted
        };

        for evicted_key in &evicted {
            self.remove_files(evicted_key).await;
        }
        if !evicted.is_empty() {
            let mut state = self.lock();
            for evicted_key in &evicted {
                state.busy.remove(evicted_key);
            }
        }

        let entry = CacheEntry {
            key: key.to_string(),
            content_type: content_type.to_string(),
            size,
            last_access: Utc::now(),
        };
        let result = self.write_entry(&entry, &bytes).await;

        if result.is_err() {
            self.remove_files(key).await;
        }

        let mut state = self.lock();
        state.busy.remove(key);
        state.reserved = state.reserved.saturating_sub(size);
        match result {
            Ok(()) => {
                state.committed += size;
                state.lru.put(key.to_string(), entry);
                tracing::debug!(
                    "Cached {} ({:.2} KB), total: {:.2} MB",
                    key,
                    size as f64 / 1024.0,
                    state.committed as f64 / 1024.0 / 1024.0
                );
                CacheWriteOutcome::Stored { evicted }
            }
            Err(err) => {
                tracing::warn!("Cache write failed for {}: {}", key, err);
                CacheWriteOutcome::Degraded(err)
            }
        }
    }

    /// Pop least recently used entries until the cache is at or under the
    /// low-water mark and `incoming` more bytes fit. Popped keys are marked
    /// busy until their files are gone.
    fn evict_locked(&self, state: &mut CacheState, incoming: u64) -> Vec<String> {
        let mut evicted = Vec::new();
        while state.committed + state.reserved > self.low_water
            || state.committed + state.reserved + incoming > self.capacity
        {
            let Some((key, entry)) = state.lru.pop_lru() else {
                tracing::warn!("Cache full and cannot evict, continuing anyway");
                break;
            };
            tracing::debug!("Evicting {} ({} bytes)", key, entry.size);
            state.committed = state.committed.saturating_sub(entry.size);
            state.busy.insert(key.clone());
            evicted.push(key);
        }
        evicted
    }

    async fn write_entry(&self, entry: &CacheEntry, bytes: &[u8]) -> Result<(), CacheIoError> {
        let data = self.data_path(&entry.key);
        if let Some(parent) = data.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CacheIoError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let meta = serde_json::to_vec(entry).map_err(|source| CacheIoError::Metadata {
            key: entry.key.clone(),
            source,
        })?;

        write_atomic(&data, bytes).await?;
        write_atomic(&data.with_extension(META_EXT), &meta).await?;
        Ok(())
    }

    async fn touch_sidecar(&self, data: &Path, entry: &CacheEntry) {
        let result = match serde_json::to_vec(entry) {
            Ok(meta) => write_atomic(&data.with_extension(META_EXT), &meta).await,
            Err(source) => Err(CacheIoError::Metadata {
                key: entry.key.clone(),
                source,
            }),
        };
        if let Err(e) = result {
            tracing::debug!("Failed to record access for {}: {}", entry.key, e);
        }
    }

    async fn remove_files(&self, key: &str) {
        let data = self.data_path(key);
        for path in [data.with_extension(META_EXT), data] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove cached file {:?}: {}", path, e);
                }
            }
        }
    }

    fn remove_files_sync(&self, key: &str) {
        let data = self.data_path(key);
        let _ = fs::remove_file(data.with_extension(META_EXT));
        let _ = fs::remove_file(data);
    }

    /// Drop a single entry. Returns false if it was absent or busy.
    pub async fn remove(&self, key: &str) -> bool {
        {
            let mut state = self.lock();
            if state.busy.contains(key) {
                return false;
            }
            let Some(entry) = state.lru.pop(key) else {
                return false;
            };
            state.committed = state.committed.saturating_sub(entry.size);
            state.busy.insert(key.to_string());
        }
        self.remove_files(key).await;
        self.lock().busy.remove(key);
        true
    }

    /// Remove entries whose content id is not in `ids`. Keys without a
    /// content id are kept. Returns the number removed.
    pub async fn retain_ids(&self, ids: &HashSet<&str>) -> usize {
        let orphans: Vec<String> = {
            let state = self.lock();
            state
                .lru
                .iter()
                .filter_map(|(key, _)| {
                    let id = crate::media::CacheKey::content_id(key)?;
                    (!ids.contains(id)).then(|| key.clone())
                })
                .collect()
        };

        let mut removed = 0;
        for key in orphans {
            tracing::debug!("Removing orphaned cache entry: {}", key);
            if self.remove(&key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Remove every entry and its backing files.
    pub async fn clear(&self) {
        let removed = {
            let mut state = self.lock();
            let count = state.lru.len();
            state.lru.clear();
            state.committed = 0;
            count
        };

        if let Err(e) = tokio::fs::remove_dir_all(&self.cache_dir).await {
            tracing::warn!("Failed to clear cache directory: {}", e);
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.cache_dir).await {
            tracing::warn!("Failed to recreate cache directory: {}", e);
        }
        tracing::info!("Cache cleared ({} entries)", removed);
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            item_count: state.lru.len(),
            total_bytes: state.committed,
            capacity_bytes: self.capacity,
        }
    }

    /// Whether `key` is currently a committed entry.
    pub fn contains(&self, key: &str) -> bool {
        let state = self.lock();
        !state.busy.contains(key) && state.lru.contains(key)
    }
}

fn read_sidecar(path: &Path) -> Option<CacheEntry> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheIoError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let temp = path.with_extension(format!("{}.{}", ext, TEMP_EXT));
    let write_err = |source| CacheIoError::Write {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::write(&temp, bytes).await.map_err(write_err)?;
    if let Err(source) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(write_err(source));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload(n: usize) -> Bytes {
        Bytes::from(vec![7u8; n])
    }

    #[tokio::test]
    async fn get_after_put_returns_bytes_and_type() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), 10_000, 0.7).unwrap();

        assert!(cache.get("a:display").await.is_none());
        let outcome = cache
            .put("a:display", Bytes::from_static(b"jpeg-bytes"), "image/jpeg")
            .await;
        assert!(outcome.is_stored());

        let hit = cache.get("a:display").await.unwrap();
        assert_eq!(&hit.bytes[..], b"jpeg-bytes");
        assert_eq!(hit.content_type, "image/jpeg");
        assert_eq!(
            cache.stats(),
            CacheStats {
                item_count: 1,
                total_bytes: 10,
                capacity_bytes: 10_000
            }
        );
    }

    #[tokio::test]
    async fn evicts_oldest_first_down_to_low_water() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), 1000, 0.7).unwrap();

        for key in ["A", "B", "C"] {
            assert!(cache.put(key, payload(300), "image/jpeg").await.is_stored());
        }
        assert_eq!(cache.stats().total_bytes, 900);

        let outcome = cache.put("D", payload(300), "image/jpeg").await;
        match outcome {
            CacheWriteOutcome::Stored { evicted } => assert_eq!(evicted, vec!["A".to_string()]),
            other => panic!("unexpected outcome {:?}", other),
        }

        assert!(!cache.contains("A"));
        assert!(cache.contains("B") && cache.contains("C") && cache.contains("D"));
        let stats = cache.stats();
        assert_eq!(stats.item_count, 3);
        assert!(stats.total_bytes <= 1000);
        assert_eq!(stats.total_bytes, 900);
    }

    #[tokio::test]
    async fn hits_protect_entries_from_eviction() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), 1000, 0.7).unwrap();

        for key in ["A", "B", "C"] {
            cache.put(key, payload(300), "image/jpeg").await;
        }
        assert!(cache.get("A").await.is_some());

        cache.put("D", payload(300), "image/jpeg").await;
        assert!(cache.contains("A"));
        assert!(!cache.contains("B"));
        assert!(cache.contains("C") && cache.contains("D"));
    }

    #[tokio::test]
    async fn total_never_exceeds_capacity() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), 1000, 0.7).unwrap();

        for i in 0..40usize {
            let size = 50 + (i * 37) % 400;
            cache.put(&format!("k{}", i), payload(size), "image/jpeg").await;
            if i % 3 == 0 {
                let _ = cache.get(&format!("k{}", i / 2)).await;
            }
            assert!(cache.stats().total_bytes <= 1000);
        }
        // The most recent write always survives its own eviction pass.
        assert!(cache.contains("k39"));
    }

    #[tokio::test]
    async fn oversized_entries_are_not_cached() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), 100, 0.7).unwrap();
        assert!(matches!(
            cache.put("big", payload(101), "video/mp4").await,
            CacheWriteOutcome::TooLarge
        ));
        assert_eq!(cache.stats().item_count, 0);
    }

    #[tokio::test]
    async fn overwrite_replaces_previous_entry() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), 1000, 0.7).unwrap();
        cache.put("a", payload(100), "image/jpeg").await;
        cache
            .put("a", Bytes::from_static(b"png"), "image/png")
            .await;

        let hit = cache.get("a").await.unwrap();
        assert_eq!(hit.content_type, "image/png");
        assert_eq!(cache.stats().total_bytes, 3);
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = ContentCache::new(dir.path().to_path_buf(), 1000, 0.7).unwrap();
            cache.put("a:display", payload(10), "image/jpeg").await;
            cache.put("b:video", payload(20), "video/mp4").await;
        }
        // Leftover temp file from an interrupted write.
        let shard = dir.path().join("zz");
        fs::create_dir_all(&shard).unwrap();
        fs::write(shard.join("partial.tmp"), b"junk").unwrap();

        let cache = ContentCache::new(dir.path().to_path_buf(), 1000, 0.7).unwrap();
        assert_eq!(cache.stats().item_count, 2);
        assert_eq!(cache.stats().total_bytes, 30);
        assert_eq!(cache.get("b:video").await.unwrap().content_type, "video/mp4");
        assert!(!shard.join("partial.tmp").exists());
    }

    #[tokio::test]
    async fn access_order_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = ContentCache::new(dir.path().to_path_buf(), 1000, 0.7).unwrap();
            cache.put("a", payload(400), "image/jpeg").await;
            cache.put("b", payload(400), "image/jpeg").await;
            assert!(cache.get("a").await.is_some());
        }

        let cache = ContentCache::new(dir.path().to_path_buf(), 1000, 0.7).unwrap();
        match cache.put("c", payload(400), "image/jpeg").await {
            CacheWriteOutcome::Stored { evicted } => assert_eq!(evicted, vec!["b".to_string()]),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
    }

    #[tokio::test]
    async fn missing_data_file_degrades_to_miss() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), 1000, 0.7).unwrap();
        cache.put("a", payload(10), "image/jpeg").await;
        fs::remove_file(cache.data_path("a")).unwrap();

        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.stats().item_count, 0);
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn unwritable_directory_degrades_put() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().join("cache"), 1000, 0.7).unwrap();
        // Replace the cache directory with a plain file so shard creation fails.
        fs::remove_dir_all(dir.path().join("cache")).unwrap();
        fs::write(dir.path().join("cache"), b"not a dir").unwrap();

        let outcome = cache.put("a", payload(10), "image/jpeg").await;
        assert!(matches!(outcome, CacheWriteOutcome::Degraded(_)));
        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn concurrent_puts_for_distinct_keys() {
        let dir = tempdir().unwrap();
        let cache =
            std::sync::Arc::new(ContentCache::new(dir.path().to_path_buf(), 100_000, 0.7).unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.put(&format!("k{}", i), payload(100), "image/jpeg").await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_stored());
        }
        assert_eq!(cache.stats().item_count, 16);
        assert_eq!(cache.stats().total_bytes, 1600);
    }

    #[tokio::test]
    async fn retain_and_clear() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), 10_000, 0.7).unwrap();
        cache.put("a:display", payload(10), "image/jpeg").await;
        cache.put("b:display", payload(10), "image/jpeg").await;
        cache.put("c:video", payload(10), "video/mp4").await;

        let keep: HashSet<&str> = ["a", "c"].into_iter().collect();
        assert_eq!(cache.retain_ids(&keep).await, 1);
        assert!(!cache.contains("b:display"));

        cache.clear().await;
        assert_eq!(cache.stats().item_count, 0);
        assert_eq!(cache.stats().total_bytes, 0);
        assert!(cache.get("a:display").await.is_none());
        assert!(dir.path().exists());
    }
}
