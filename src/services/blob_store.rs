//! src/services/blob_store.rs
//!
//! BlobStore - the storage engine. Payloads live as flat files under the
//! storage directory (`{id}_{filename}` plus a `.meta` sidecar), metadata is
//! kept in an in-memory index persisted to `file_index.json`, and recently
//! used payloads are held in a bounded cache. Quota accounting for disk and
//! memory is owned here.

use crate::{
    config::StorageConfig,
    models::{IndexEntry, StoredObject, metadata::SIDECAR_SUFFIX, metadata::SidecarRecord},
    models::object::{file_extension, mime_type_for},
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration as StdDuration,
};
use thiserror::Error;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    cache::ObjectCache,
    compression::{Compressor, ResourceProbe},
    fsutil::{remove_file_if_exists, write_atomic},
    index::{self, IndexSource, ObjectIndex},
    tasks::{self, BackgroundTask},
};

const MAX_FILENAME_LEN: usize = 255;
const ID_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage limit exceeded: {requested} bytes requested, {used} of {limit} bytes in use")]
    CapacityExceeded { requested: u64, used: u64, limit: u64 },
    #[error("invalid filename `{0}`")]
    InvalidFilename(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything needed to store one object.
#[derive(Clone, Debug, Default)]
pub struct StoreRequest {
    pub filename: String,
    pub data: Bytes,
    pub is_public: bool,
    pub ttl_seconds: Option<u64>,
    pub uploader_ip: String,
    pub uploader_agent: String,
    pub metadata: BTreeMap<String, String>,
}

/// Listing filter and page selection. `page` is 1-based.
#[derive(Clone, Debug)]
pub struct ListQuery {
    pub page: usize,
    pub page_size: usize,
    pub extension: Option<String>,
    pub search: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 10,
            extension: None,
            search: None,
        }
    }
}

impl ListQuery {
    /// Extension must match exactly and `search` must be a substring of the
    /// filename or id; both case-insensitive, blank filters ignored.
    pub fn matches(&self, entry: &IndexEntry) -> bool {
        if let Some(ext) = non_blank(self.extension.as_deref()) {
            if !ext.eq_ignore_ascii_case(&file_extension(&entry.filename)) {
                return false;
            }
        }
        if let Some(search) = non_blank(self.search.as_deref()) {
            let needle = search.to_lowercase();
            return entry.filename.to_lowercase().contains(&needle)
                || entry.id.to_lowercase().contains(&needle);
        }
        true
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// BlobStore provides the object operations:
/// - Store an object (optional compression, quota check, disk write, index + cache insert)
/// - Get an object (cache first, then disk)
/// - List objects (filtered, newest first, paged)
/// - Delete an object (index, disk, cache)
/// - Sweep expired objects and evict cold cache entries
///
/// Cloning is cheap; clones share the same state. Structural mutations are
/// serialized by one async mutex; reads go straight to the concurrent maps.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<Inner>,
}

struct Inner {
    config: StorageConfig,
    dir: PathBuf,
    index: ObjectIndex,
    cache: ObjectCache,
    compressor: Compressor,
    probe: Arc<dyn ResourceProbe>,
    used_storage: AtomicU64,
    write_lock: Mutex<()>,
    tasks: std::sync::Mutex<Vec<BackgroundTask>>,
}

impl BlobStore {
    /// Open (or create) the store rooted at `config.storage_dir`.
    ///
    /// Loads the persisted index, rebuilding it from the directory when the
    /// index file is missing or corrupt, and starts the periodic expiry and
    /// cache eviction tasks whose intervals are non-zero.
    pub async fn open(config: StorageConfig, probe: Arc<dyn ResourceProbe>) -> StoreResult<Self> {
        let dir = config.storage_dir.clone();
        fs::create_dir_all(&dir).await?;

        let (entries, source) = index::load(&dir).await?;
        let index = ObjectIndex::from_entries(entries);
        let used_storage = index.total_size();

        let store = Self {
            inner: Arc::new(Inner {
                cache: ObjectCache::new(config.max_ram, config.cache_max_entries),
                compressor: Compressor::new(config.compression.level),
                dir,
                index,
                probe,
                used_storage: AtomicU64::new(used_storage),
                write_lock: Mutex::new(()),
                tasks: std::sync::Mutex::new(Vec::new()),
                config,
            }),
        };

        if source.needs_persist() {
            let _guard = store.inner.write_lock.lock().await;
            store.persist_index_or_warn().await;
        }

        let cfg = &store.inner.config;
        info!("BlobStore initialized:");
        info!("- Storage directory: {}", store.inner.dir.display());
        info!("- Max RAM: {}MB", cfg.max_ram / 1024 / 1024);
        info!("- Max Storage: {}MB", cfg.max_storage / 1024 / 1024);
        info!(
            "- Compression: {}",
            if cfg.compression.enabled { "enabled" } else { "disabled" }
        );
        info!(
            "- Expiration: {}",
            if cfg.enable_expiration { "enabled" } else { "disabled" }
        );
        info!(
            "- Files indexed: {} ({} bytes)",
            store.inner.index.len(),
            used_storage
        );

        store.start_background_tasks();
        Ok(store)
    }

    fn start_background_tasks(&self) {
        let cfg = &self.inner.config;
        let mut started = Vec::new();

        if cfg.enable_expiration && cfg.cleanup_interval_secs > 0 {
            started.push(BackgroundTask::spawn_periodic(
                "object-expiry",
                StdDuration::from_secs(cfg.cleanup_interval_secs),
                Arc::downgrade(&self.inner),
                |inner: Arc<Inner>| async move {
                    BlobStore { inner }.cleanup_expired_files().await;
                },
            ));
        }

        if cfg.cache_sweep_interval_secs > 0 {
            started.push(BackgroundTask::spawn_periodic(
                "cache-eviction",
                StdDuration::from_secs(cfg.cache_sweep_interval_secs),
                Arc::downgrade(&self.inner),
                |inner: Arc<Inner>| async move {
                    BlobStore { inner }.evict_cache().await;
                },
            ));
        }

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.extend(started);
        }
    }

    /// Stop background tasks and persist the index one final time.
    pub async fn shutdown(&self) {
        let running = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        tasks::stop_all(running).await;

        let _guard = self.inner.write_lock.lock().await;
        self.persist_index_or_warn().await;
        info!("BlobStore shutdown completed");
    }

    /// Store a new object.
    ///
    /// - Computes the expiry from the caller TTL (clamped to the max TTL) or the default TTL.
    /// - Compresses when enabled, above the threshold, and memory headroom allows it.
    /// - Rejects with `CapacityExceeded` when the disk budget would be exceeded.
    /// - Writes payload and sidecar, then updates index, counters and cache,
    ///   and persists the index before returning.
    pub async fn store(&self, req: StoreRequest) -> StoreResult<StoredObject> {
        validate_filename(&req.filename)?;

        let now = Utc::now();
        let expires_at = self.expiry_for(req.ttl_seconds, now);
        let original = req.data.clone();
        let original_size = original.len() as u64;
        let (payload, compressed) = self.maybe_compress(&req.filename, req.data).await;
        let size = payload.len() as u64;

        let _guard = self.inner.write_lock.lock().await;

        let used = self.used_storage();
        let limit = self.inner.config.max_storage;
        if limit > 0 && used.saturating_add(size) > limit {
            warn!(
                "Storage limit exceeded for file {} ({} bytes, {} of {} used)",
                req.filename, size, used, limit
            );
            return Err(StoreError::CapacityExceeded {
                requested: size,
                used,
                limit,
            });
        }

        let id = self.generate_id();
        let entry = IndexEntry {
            disk_path: format!("{}_{}", id, req.filename),
            id: id.clone(),
            mime_type: mime_type_for(&file_extension(&req.filename)).to_string(),
            filename: req.filename,
            size,
            original_size,
            is_public: req.is_public,
            is_compressed: compressed,
            uploaded_at: now,
            expires_at,
            uploader_ip: req.uploader_ip,
            uploader_agent: req.uploader_agent,
            metadata: req.metadata,
        };

        if let Err(err) = self.write_to_disk(&entry, &payload).await {
            warn!("Failed to save file {} to disk: {}", entry.disk_path, err);
            return Err(err.into());
        }

        self.inner.index.insert(entry.clone());
        self.inner.used_storage.fetch_add(size, Ordering::SeqCst);
        self.inner.cache.insert(&id, payload);
        self.persist_index_or_warn().await;

        info!(
            "Stored file: {} (ID: {}, Size: {} bytes, compressed: {})",
            entry.filename, id, size, compressed
        );
        Ok(entry.to_stored_object(original))
    }

    /// Fetch an object with its decompressed payload.
    ///
    /// Expired objects are deleted and reported as absent.
    pub async fn get(&self, id: &str) -> StoreResult<Option<StoredObject>> {
        let Some(entry) = self.live_entry(id).await else {
            return Ok(None);
        };
        let data = self.load_payload(&entry).await?;
        Ok(data.map(|data| entry.to_stored_object(data)))
    }

    /// Same lookup as [`get`](Self::get), returning only the payload bytes.
    pub async fn get_data(&self, id: &str) -> StoreResult<Option<Bytes>> {
        let Some(entry) = self.live_entry(id).await else {
            return Ok(None);
        };
        self.load_payload(&entry).await
    }

    /// Metadata-only lookup; never touches the payload.
    pub async fn get_metadata(&self, id: &str) -> Option<StoredObject> {
        self.live_entry(id)
            .await
            .map(|entry| entry.to_stored_object(Bytes::new()))
    }

    /// Remove an object from the index, disk and cache.
    ///
    /// Disk errors are logged and do not fail the call. Returns `false` for
    /// unknown ids.
    pub async fn delete(&self, id: &str) -> bool {
        let _guard = self.inner.write_lock.lock().await;
        let Some(entry) = self.remove_locked(id).await else {
            return false;
        };
        self.persist_index_or_warn().await;
        info!("Deleted file: {} (ID: {})", entry.filename, id);
        true
    }

    /// Page through live objects, newest first. Payloads are left empty.
    ///
    /// Expired entries met along the way are deleted.
    pub async fn list_files(&self, query: &ListQuery) -> Vec<StoredObject> {
        let mut matching = self.live_matching(query).await;
        matching.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));

        let page = query.page.max(1);
        let start = (page - 1).saturating_mul(query.page_size);
        matching
            .into_iter()
            .skip(start)
            .take(query.page_size)
            .map(|entry| entry.to_stored_object(Bytes::new()))
            .collect()
    }

    /// Number of live objects matching the same filters as `list_files`.
    pub async fn total_files(&self, query: &ListQuery) -> usize {
        self.live_matching(query).await.len()
    }

    /// Delete every expired object; returns how many were removed.
    pub async fn cleanup_expired_files(&self) -> usize {
        let expired = self.inner.index.expired_ids(Utc::now());
        if expired.is_empty() {
            return 0;
        }
        info!("Cleaning up {} expired files", expired.len());
        self.delete_expired(expired).await
    }

    /// Run the cache eviction policy under the store's mutation lock.
    pub async fn evict_cache(&self) -> usize {
        let _guard = self.inner.write_lock.lock().await;
        self.inner.cache.evict()
    }

    pub fn file_count(&self) -> usize {
        self.inner.index.len()
    }

    pub fn cached_count(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn used_memory(&self) -> u64 {
        self.inner.cache.used_bytes()
    }

    pub fn used_storage(&self) -> u64 {
        self.inner.used_storage.load(Ordering::SeqCst)
    }

    pub fn max_ram(&self) -> u64 {
        self.inner.config.max_ram
    }

    pub fn max_storage(&self) -> u64 {
        self.inner.config.max_storage
    }

    pub fn storage_dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.inner.cache.contains(id)
    }

    /// Drop a single object from the cache, keeping it indexed.
    pub async fn evict_from_cache(&self, id: &str) -> bool {
        let _guard = self.inner.write_lock.lock().await;
        self.inner.cache.remove(id).is_some()
    }

    fn expiry_for(&self, ttl_seconds: Option<u64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let cfg = &self.inner.config;
        if !cfg.enable_expiration {
            return None;
        }
        let ttl = match ttl_seconds.filter(|ttl| *ttl > 0) {
            Some(ttl) if cfg.max_ttl_secs > 0 => ttl.min(cfg.max_ttl_secs),
            Some(ttl) => ttl,
            None if cfg.default_ttl_secs > 0 => cfg.default_ttl_secs,
            None => return None,
        };
        i64::try_from(ttl)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
    }

    /// Returns the bytes to write and whether they are compressed.
    async fn maybe_compress(&self, filename: &str, data: Bytes) -> (Bytes, bool) {
        let cfg = &self.inner.config.compression;
        if !cfg.enabled || (data.len() as u64) < cfg.threshold {
            return (data, false);
        }

        let needed = (data.len() as u64).saturating_mul(2);
        let available = self.inner.probe.available_memory();
        if available < needed {
            warn!(
                "Skipping compression of file {} due to insufficient memory (needed: {} bytes, available: {} bytes)",
                filename, needed, available
            );
            return (data, false);
        }

        let compressor = self.inner.compressor;
        let input = data.clone();
        match tokio::task::spawn_blocking(move || compressor.compress_if_smaller(&input)).await {
            Ok(Ok(Some(packed))) => {
                info!(
                    "Compressed file {} from {} to {} bytes",
                    filename,
                    data.len(),
                    packed.len()
                );
                (Bytes::from(packed), true)
            }
            Ok(Ok(None)) => {
                debug!("Compression of {} would not shrink it; storing raw", filename);
                (data, false)
            }
            Ok(Err(err)) => {
                warn!("Failed to compress file {}: {}", filename, err);
                (data, false)
            }
            Err(err) => {
                warn!("Compression task for {} failed: {}", filename, err);
                (data, false)
            }
        }
    }

    /// Generate a 16-hex-char id not present in the index.
    ///
    /// Callers hold the write lock.
    fn generate_id(&self) -> String {
        loop {
            let mut id = Uuid::new_v4().simple().to_string();
            id.truncate(ID_LEN);
            if !self.inner.index.contains(&id) {
                return id;
            }
        }
    }

    async fn write_to_disk(&self, entry: &IndexEntry, payload: &[u8]) -> io::Result<()> {
        let payload_path = self.inner.dir.join(&entry.disk_path);
        write_atomic(&payload_path, payload).await?;

        let sidecar = SidecarRecord {
            is_public: entry.is_public,
            compressed: entry.is_compressed,
            original_size: Some(entry.original_size),
            uploaded_at: Some(entry.uploaded_at),
            expires_at: entry.expires_at,
            uploader_ip: entry.uploader_ip.clone(),
            uploader_agent: entry.uploader_agent.clone(),
            mime_type: entry.mime_type.clone(),
            custom: entry.metadata.clone(),
        };
        if let Err(err) = write_atomic(&self.sidecar_path(entry), sidecar.encode().as_bytes()).await
        {
            let _ = remove_file_if_exists(&payload_path).await;
            return Err(err);
        }
        Ok(())
    }

    fn sidecar_path(&self, entry: &IndexEntry) -> PathBuf {
        self.inner
            .dir
            .join(format!("{}{}", entry.disk_path, SIDECAR_SUFFIX))
    }

    async fn live_entry(&self, id: &str) -> Option<IndexEntry> {
        let entry = self.inner.index.get(id)?;
        if entry.is_expired() {
            debug!("File {} expired, removing", id);
            self.delete(id).await;
            return None;
        }
        Some(entry)
    }

    /// Live entries passing `query`, unordered. Expired ones are deleted.
    async fn live_matching(&self, query: &ListQuery) -> Vec<IndexEntry> {
        let now = Utc::now();
        let (expired, live): (Vec<IndexEntry>, Vec<IndexEntry>) = self
            .inner
            .index
            .snapshot()
            .into_iter()
            .partition(|entry| entry.is_expired_at(now));

        if !expired.is_empty() {
            self.delete_expired(expired.into_iter().map(|entry| entry.id).collect())
                .await;
        }

        live.into_iter().filter(|entry| query.matches(entry)).collect()
    }

    async fn delete_expired(&self, ids: Vec<String>) -> usize {
        let _guard = self.inner.write_lock.lock().await;
        let mut removed = 0;
        for id in ids {
            // the entry may have been replaced or removed since the scan
            let still_expired = self
                .inner
                .index
                .get(&id)
                .is_some_and(|entry| entry.is_expired());
            if still_expired && self.remove_locked(&id).await.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.persist_index_or_warn().await;
        }
        removed
    }

    /// Read (cache first) and decompress an entry's payload.
    ///
    /// A payload file missing from disk drops the entry and yields `None`.
    async fn load_payload(&self, entry: &IndexEntry) -> StoreResult<Option<Bytes>> {
        let raw = match self.inner.cache.get(&entry.id) {
            Some(raw) => raw,
            None => {
                let path = self.inner.dir.join(&entry.disk_path);
                match fs::read(&path).await {
                    Ok(raw) => {
                        let raw = Bytes::from(raw);
                        self.cache_if_indexed(&entry.id, raw.clone());
                        raw
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        warn!("File missing from disk: {}", entry.disk_path);
                        self.forget_missing(&entry.id).await;
                        return Ok(None);
                    }
                    Err(err) => {
                        warn!("Failed to load file {} from disk: {}", entry.disk_path, err);
                        return Err(err.into());
                    }
                }
            }
        };

        if !entry.is_compressed {
            return Ok(Some(raw));
        }

        let compressor = self.inner.compressor;
        let data = tokio::task::spawn_blocking(move || compressor.decompress(&raw))
            .await
            .map_err(io::Error::other)?
            .map_err(|err| {
                warn!("Failed to decompress file {}: {}", entry.id, err);
                err
            })?;
        Ok(Some(data))
    }

    /// Insert into the cache when within budget, backing out if the object
    /// was deleted concurrently.
    fn cache_if_indexed(&self, id: &str, raw: Bytes) {
        if self.inner.cache.insert_if_room(id, raw) && !self.inner.index.contains(id) {
            self.inner.cache.remove(id);
        }
    }

    async fn forget_missing(&self, id: &str) {
        let _guard = self.inner.write_lock.lock().await;
        if self.remove_locked(id).await.is_some() {
            self.persist_index_or_warn().await;
        }
    }

    /// Remove an entry plus its files and cache slot, adjusting counters.
    ///
    /// Callers hold the write lock and persist the index afterwards.
    async fn remove_locked(&self, id: &str) -> Option<IndexEntry> {
        let entry = self.inner.index.remove(id)?;

        let payload_path = self.inner.dir.join(&entry.disk_path);
        if let Err(err) = remove_file_if_exists(&payload_path).await {
            warn!("Failed to delete file {} from disk: {}", payload_path.display(), err);
        }
        let sidecar_path = self.sidecar_path(&entry);
        if let Err(err) = remove_file_if_exists(&sidecar_path).await {
            warn!("Failed to delete sidecar {}: {}", sidecar_path.display(), err);
        }

        self.inner.cache.remove(id);
        let _ = self
            .inner
            .used_storage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(entry.size))
            });
        Some(entry)
    }

    /// Persist the index. Callers hold the write lock.
    async fn persist_index_or_warn(&self) {
        let snapshot = self.inner.index.snapshot();
        if let Err(err) = index::save(&self.inner.dir, snapshot, self.used_storage()).await {
            warn!("Failed to save file index: {}", err);
        }
    }
}

/// Reject names that would escape the storage directory or break the
/// `{id}_{filename}` layout.
pub fn validate_filename(name: &str) -> StoreResult<()> {
    let invalid = name.trim().is_empty()
        || name.len() > MAX_FILENAME_LEN
        || name == "."
        || name == ".."
        || name.contains("..")
        || name.ends_with(SIDECAR_SUFFIX)
        || name.chars().any(|c| matches!(c, '/' | '\\') || c.is_control());
    if invalid {
        return Err(StoreError::InvalidFilename(name.to_string()));
    }
    Ok(())
}
