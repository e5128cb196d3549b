//! src/services/chunked_upload.rs
//!
//! ChunkedUploadManager - resumable uploads for files too large for one
//! request. Each session owns a scratch directory under the temp dir holding
//! one file per chunk; once every chunk has arrived the chunks are verified,
//! concatenated in index order and handed to the BlobStore as a normal store.

use crate::{
    config::ChunkedUploadConfig,
    models::{InitUpload, UploadSession, UploadState, upload::chunk_count},
};
use bytes::{Bytes, BytesMut};
use chrono::Duration;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration as StdDuration,
};
use thiserror::Error;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    blob_store::{BlobStore, StoreError, StoreRequest, validate_filename},
    fsutil::{remove_dir_if_exists, write_atomic},
    tasks::{self, BackgroundTask},
};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session `{0}` not found")]
    SessionNotFound(String),
    #[error("upload session `{0}` has expired")]
    SessionExpired(String),
    #[error("invalid total size {size}: must be between 1 and {max} bytes")]
    InvalidSize { size: u64, max: u64 },
    #[error("total size {size} needs more than {max} chunks of {chunk_size} bytes", max = u32::MAX)]
    TooManyChunks { size: u64, chunk_size: u64 },
    #[error("chunk {index} out of range (upload has {total} chunks)")]
    ChunkOutOfRange { index: u32, total: u32 },
    #[error("chunk payload is empty")]
    EmptyChunk,
    #[error("chunk {0} is missing and must be re-sent")]
    MissingChunk(u32),
    #[error("chunk {0} failed checksum verification and must be re-sent")]
    ChecksumMismatch(u32),
    #[error("reassembled size {actual} does not match declared size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// What happened to a submitted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accepted,
    /// Index already recorded; nothing was written.
    Duplicate,
    /// This call completed the upload.
    Completed { object_id: String },
}

#[derive(Clone)]
pub struct ChunkedUploadManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ChunkedUploadConfig,
    store: BlobStore,
    sessions: DashMap<String, UploadSession>,
    write_lock: Mutex<()>,
    tasks: std::sync::Mutex<Vec<BackgroundTask>>,
}

impl ChunkedUploadManager {
    /// Create the scratch directory, drop scratch data left by a previous
    /// process and start the session sweep.
    pub async fn new(config: ChunkedUploadConfig, store: BlobStore) -> io::Result<Self> {
        fs::create_dir_all(&config.temp_dir).await?;
        let purged = purge_scratch_root(&config.temp_dir).await?;
        if purged > 0 {
            info!("Removed {} orphaned upload directories", purged);
        }

        let manager = Self {
            inner: Arc::new(Inner {
                config,
                store,
                sessions: DashMap::new(),
                write_lock: Mutex::new(()),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        };

        let cfg = &manager.inner.config;
        if cfg.sweep_interval_secs > 0 {
            let task = BackgroundTask::spawn_periodic(
                "upload-session-expiry",
                StdDuration::from_secs(cfg.sweep_interval_secs),
                Arc::downgrade(&manager.inner),
                |inner: Arc<Inner>| async move {
                    ChunkedUploadManager { inner }.cleanup_expired_uploads().await;
                },
            );
            if let Ok(mut tasks) = manager.inner.tasks.lock() {
                tasks.push(task);
            }
        }

        info!(
            "ChunkedUploadManager initialized (temp dir: {}, chunk size: {} bytes)",
            cfg.temp_dir.display(),
            cfg.chunk_size
        );
        Ok(manager)
    }

    pub fn chunk_size(&self) -> u64 {
        self.inner.config.chunk_size.max(1)
    }

    pub fn max_file_size(&self) -> u64 {
        self.inner.config.max_file_size
    }

    /// Open a new session and its scratch directory.
    pub async fn initialize_upload(&self, req: InitUpload) -> UploadResult<UploadSession> {
        let max = self.inner.config.max_file_size;
        if req.total_size == 0 || (max > 0 && req.total_size > max) {
            return Err(UploadError::InvalidSize {
                size: req.total_size,
                max,
            });
        }
        let chunk_size = self.chunk_size();
        let total_chunks =
            chunk_count(req.total_size, chunk_size).ok_or(UploadError::TooManyChunks {
                size: req.total_size,
                chunk_size,
            })?;
        validate_filename(&req.filename)?;

        let _guard = self.inner.write_lock.lock().await;
        let upload_id = loop {
            let id = Uuid::new_v4().simple().to_string();
            if !self.inner.sessions.contains_key(&id) {
                break id;
            }
        };
        fs::create_dir_all(self.scratch_dir(&upload_id)).await?;

        let session = UploadSession::new(upload_id.clone(), req, chunk_size, total_chunks, self.window());
        self.inner.sessions.insert(upload_id.clone(), session.clone());

        info!(
            "Initialized chunked upload: {} (ID: {}, Size: {} bytes, Chunks: {})",
            session.filename, upload_id, session.total_size, session.total_chunks
        );
        Ok(session)
    }

    /// Accept one chunk.
    ///
    /// Re-sending a recorded index is a no-op, except that it retries
    /// finalize when every chunk is present but a previous finalize failed.
    /// The call that completes the ledger finalizes the upload before
    /// returning.
    pub async fn upload_chunk(&self, upload_id: &str, index: u32, data: Bytes) -> UploadResult<ChunkOutcome> {
        let _guard = self.inner.write_lock.lock().await;
        let session = self.live_session(upload_id).await?;

        if index >= session.total_chunks {
            return Err(UploadError::ChunkOutOfRange {
                index,
                total: session.total_chunks,
            });
        }
        if data.is_empty() {
            return Err(UploadError::EmptyChunk);
        }

        if session.has_chunk(index) {
            debug!("Chunk {} already received for upload {}", index, upload_id);
            if session.ledger_complete() && !session.is_completed() {
                let object_id = self.finalize_locked(upload_id).await?;
                return Ok(ChunkOutcome::Completed { object_id });
            }
            return Ok(ChunkOutcome::Duplicate);
        }

        let dir = self.scratch_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        write_atomic(&chunk_path(&dir, index), &data).await?;

        let size = data.len() as u64;
        let checksum = tokio::task::spawn_blocking(move || sha256_hex(&data))
            .await
            .map_err(io::Error::other)?;

        let complete = match self.inner.sessions.get_mut(upload_id) {
            Some(mut session) => {
                session.record_chunk(index, size, checksum);
                debug!(
                    "Received chunk {}/{} for upload {} ({} bytes)",
                    index + 1,
                    session.total_chunks,
                    upload_id,
                    size
                );
                session.ledger_complete()
            }
            None => return Err(UploadError::SessionNotFound(upload_id.to_string())),
        };

        if complete {
            let object_id = self.finalize_locked(upload_id).await?;
            return Ok(ChunkOutcome::Completed { object_id });
        }
        Ok(ChunkOutcome::Accepted)
    }

    /// Retry finalize for a session whose chunks have all arrived.
    ///
    /// Returns the object id; already-completed sessions return their
    /// existing object id.
    pub async fn finalize_upload(&self, upload_id: &str) -> UploadResult<String> {
        let _guard = self.inner.write_lock.lock().await;
        self.live_session(upload_id).await?;
        self.finalize_locked(upload_id).await
    }

    /// Session snapshot, or `None` when unknown. Expired sessions are
    /// discarded on lookup.
    pub async fn get_upload(&self, upload_id: &str) -> Option<UploadSession> {
        let session = self.inner.sessions.get(upload_id).map(|s| s.clone())?;
        if session.is_expired() {
            let _guard = self.inner.write_lock.lock().await;
            self.expire_locked(upload_id).await;
            return None;
        }
        Some(session)
    }

    /// Chunk indices still to be sent, ascending.
    pub async fn missing_chunks(&self, upload_id: &str) -> Option<Vec<u32>> {
        self.get_upload(upload_id)
            .await
            .map(|session| session.missing_chunks())
    }

    /// Remove a session and its scratch files, whatever its state.
    pub async fn cancel_upload(&self, upload_id: &str) -> bool {
        let _guard = self.inner.write_lock.lock().await;
        if self.inner.sessions.remove(upload_id).is_none() {
            return false;
        }
        self.purge_scratch(upload_id).await;
        info!("Cancelled upload: {}", upload_id);
        true
    }

    /// Drop every session past its window; returns how many were removed.
    pub async fn cleanup_expired_uploads(&self) -> usize {
        let _guard = self.inner.write_lock.lock().await;
        let expired: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for upload_id in expired {
            if self.expire_locked(&upload_id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Cleaned up {} expired upload sessions", removed);
        }
        removed
    }

    /// Sessions still receiving chunks.
    pub fn active_uploads_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_completed())
            .count()
    }

    /// Bytes received so far across sessions still receiving chunks.
    pub fn total_uploading_bytes(&self) -> u64 {
        self.inner
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_completed())
            .map(|entry| entry.value().uploaded_bytes)
            .sum()
    }

    pub fn active_uploads(&self) -> Vec<UploadSession> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Stop the sweep and discard every session with its scratch data.
    pub async fn shutdown(&self) {
        let running = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        tasks::stop_all(running).await;

        let _guard = self.inner.write_lock.lock().await;
        self.inner.sessions.clear();
        match purge_scratch_root(&self.inner.config.temp_dir).await {
            Ok(purged) => debug!("Purged {} upload directories", purged),
            Err(err) => warn!("Failed to purge upload directories: {}", err),
        }
        info!("ChunkedUploadManager shutdown completed");
    }

    fn window(&self) -> Duration {
        let secs = self.inner.config.session_timeout_secs.min(i32::MAX as u64);
        Duration::seconds(secs as i64)
    }

    fn scratch_dir(&self, upload_id: &str) -> PathBuf {
        self.inner.config.temp_dir.join(upload_id)
    }

    /// Clone of a registered, unexpired session. Expired sessions are
    /// removed on the spot. Callers hold the write lock.
    async fn live_session(&self, upload_id: &str) -> UploadResult<UploadSession> {
        let session = self
            .inner
            .sessions
            .get(upload_id)
            .map(|s| s.clone())
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))?;
        if session.is_expired() {
            self.expire_locked(upload_id).await;
            return Err(UploadError::SessionExpired(upload_id.to_string()));
        }
        Ok(session)
    }

    async fn expire_locked(&self, upload_id: &str) -> bool {
        let removed = self
            .inner
            .sessions
            .remove_if(upload_id, |_, session| session.is_expired())
            .is_some();
        if removed {
            self.purge_scratch(upload_id).await;
            info!("Upload session expired: {}", upload_id);
        }
        removed
    }

    async fn purge_scratch(&self, upload_id: &str) {
        let dir = self.scratch_dir(upload_id);
        if let Err(err) = remove_dir_if_exists(&dir).await {
            warn!("Failed to remove upload directory {}: {}", dir.display(), err);
        }
    }

    fn set_state(&self, upload_id: &str, state: UploadState) {
        if let Some(mut session) = self.inner.sessions.get_mut(upload_id) {
            session.state = state;
        }
    }

    fn forget_chunk(&self, upload_id: &str, index: u32) {
        if let Some(mut session) = self.inner.sessions.get_mut(upload_id) {
            session.forget_chunk(index);
        }
    }

    /// Verify, reassemble and store. Scratch files are only removed after
    /// the store succeeds; any failure leaves the session open for retry.
    /// Callers hold the write lock.
    async fn finalize_locked(&self, upload_id: &str) -> UploadResult<String> {
        let session = self
            .inner
            .sessions
            .get(upload_id)
            .map(|s| s.clone())
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))?;

        if let Some(object_id) = session.final_file_id.clone().filter(|_| session.is_completed()) {
            return Ok(object_id);
        }
        if let Some(&missing) = session.missing_chunks().first() {
            return Err(UploadError::MissingChunk(missing));
        }

        self.set_state(upload_id, UploadState::Finalizing);
        info!("Finalizing chunked upload: {} ({})", session.filename, upload_id);

        let stored = match self.assemble(&session).await {
            Ok(payload) => {
                self.inner
                    .store
                    .store(StoreRequest {
                        filename: session.filename.clone(),
                        data: payload,
                        is_public: session.is_public,
                        ttl_seconds: session.ttl_seconds,
                        uploader_ip: session.uploader_ip.clone(),
                        uploader_agent: session.uploader_agent.clone(),
                        metadata: session.metadata.clone(),
                    })
                    .await
                    .map_err(UploadError::from)
            }
            Err(err) => Err(err),
        };

        let object = match stored {
            Ok(object) => object,
            Err(err) => {
                warn!("Failed to finalize upload {}: {}", upload_id, err);
                self.set_state(upload_id, UploadState::Open);
                return Err(err);
            }
        };

        if let Some(mut session) = self.inner.sessions.get_mut(upload_id) {
            session.state = UploadState::Completed;
            session.final_file_id = Some(object.id.clone());
        }
        self.purge_scratch(upload_id).await;

        info!(
            "Completed chunked upload: {} -> {} ({} bytes)",
            session.filename, object.id, session.total_size
        );
        Ok(object.id)
    }

    /// Read chunks in ascending index order, checking each against its
    /// ledger checksum. Bad or missing chunks are dropped from the ledger so
    /// they show up as missing.
    async fn assemble(&self, session: &UploadSession) -> UploadResult<Bytes> {
        let dir = self.scratch_dir(&session.upload_id);
        let capacity = usize::try_from(session.uploaded_bytes).unwrap_or(0);
        let mut payload = BytesMut::with_capacity(capacity);

        for index in 0..session.total_chunks {
            let path = chunk_path(&dir, index);
            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!("Chunk file missing: {}", path.display());
                    self.forget_chunk(&session.upload_id, index);
                    return Err(UploadError::MissingChunk(index));
                }
                Err(err) => return Err(err.into()),
            };

            let expected = session.chunks.get(&index).map(|info| info.checksum.as_str());
            if expected != Some(sha256_hex(&data).as_str()) {
                warn!(
                    "Checksum mismatch for chunk {} of upload {}",
                    index, session.upload_id
                );
                self.forget_chunk(&session.upload_id, index);
                if let Err(err) = fs::remove_file(&path).await {
                    warn!("Failed to remove corrupt chunk {}: {}", path.display(), err);
                }
                return Err(UploadError::ChecksumMismatch(index));
            }
            payload.extend_from_slice(&data);
        }

        let actual = payload.len() as u64;
        if actual != session.total_size {
            return Err(UploadError::SizeMismatch {
                expected: session.total_size,
                actual,
            });
        }
        Ok(payload.freeze())
    }
}

/// Scratch file for a chunk. Ten digits keep lexicographic order equal to
/// numeric order for every `u32` index.
fn chunk_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("chunk_{:010}", index))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Remove every session directory under the scratch root.
async fn purge_scratch_root(root: &Path) -> io::Result<usize> {
    let mut reader = match fs::read_dir(root).await {
        Ok(reader) => reader,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut purged = 0;
    while let Some(entry) = reader.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            remove_dir_if_exists(&entry.path()).await?;
            purged += 1;
        }
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionConfig, StorageConfig};
    use crate::services::compression::FixedProbe;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        temp_dir: PathBuf,
        store: BlobStore,
        manager: ChunkedUploadManager,
    }

    async fn fixture_with(max_storage: u64, session_timeout_secs: u64) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let storage = StorageConfig {
            storage_dir: tmp.path().join("storage"),
            max_ram: 1024 * 1024,
            max_storage,
            enable_expiration: true,
            default_ttl_secs: 0,
            max_ttl_secs: 0,
            cleanup_interval_secs: 0,
            cache_max_entries: 100,
            cache_sweep_interval_secs: 0,
            compression: CompressionConfig {
                enabled: false,
                level: 6,
                threshold: 1024,
            },
        };
        let store = BlobStore::open(storage, Arc::new(FixedProbe(u64::MAX)))
            .await
            .unwrap();
        let temp_dir = tmp.path().join("uploads");
        let manager = ChunkedUploadManager::new(
            ChunkedUploadConfig {
                enabled: true,
                temp_dir: temp_dir.clone(),
                chunk_size: 4,
                max_file_size: 1024,
                session_timeout_secs,
                sweep_interval_secs: 0,
            },
            store.clone(),
        )
        .await
        .unwrap();
        Fixture {
            _tmp: tmp,
            temp_dir,
            store,
            manager,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(0, 3600).await
    }

    fn init(total_size: u64) -> InitUpload {
        InitUpload {
            filename: "big.txt".into(),
            total_size,
            uploader_ip: "10.0.0.1".into(),
            uploader_agent: "test".into(),
            ..Default::default()
        }
    }

    fn chunk(data: &'static [u8]) -> Bytes {
        Bytes::from_static(data)
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_reassemble_in_index_order() {
        let f = fixture().await;
        let session = f.manager.initialize_upload(init(10)).await.unwrap();
        let id = session.upload_id.clone();
        assert_eq!(session.total_chunks, 3);
        assert_eq!(id.len(), 32);

        assert_eq!(
            f.manager.upload_chunk(&id, 2, chunk(b"JK")).await.unwrap(),
            ChunkOutcome::Accepted
        );
        f.manager.upload_chunk(&id, 0, chunk(b"ABCD")).await.unwrap();
        assert_eq!(f.manager.missing_chunks(&id).await.unwrap(), vec![1]);

        let outcome = f.manager.upload_chunk(&id, 1, chunk(b"EFGH")).await.unwrap();
        let ChunkOutcome::Completed { object_id } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };

        let data = f.store.get_data(&object_id).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"ABCDEFGHJK");

        let done = f.manager.get_upload(&id).await.unwrap();
        assert!(done.is_completed());
        assert_eq!(done.final_file_id.as_deref(), Some(object_id.as_str()));
        assert!(!f.temp_dir.join(&id).exists());
        assert_eq!(f.manager.active_uploads_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_does_not_change_ledger() {
        let f = fixture().await;
        let id = f.manager.initialize_upload(init(10)).await.unwrap().upload_id;

        f.manager.upload_chunk(&id, 0, chunk(b"ABCD")).await.unwrap();
        let before = f.manager.get_upload(&id).await.unwrap();
        assert_eq!(
            f.manager.upload_chunk(&id, 0, chunk(b"ZZ")).await.unwrap(),
            ChunkOutcome::Duplicate
        );
        let after = f.manager.get_upload(&id).await.unwrap();
        assert_eq!(after.uploaded_bytes, 4);
        assert_eq!(after.chunks[&0].checksum, before.chunks[&0].checksum);
        assert_eq!(f.manager.total_uploading_bytes(), 4);
    }

    #[tokio::test]
    async fn test_rejects_chunk_count_beyond_u32() {
        let f = fixture().await;
        let manager = ChunkedUploadManager::new(
            ChunkedUploadConfig {
                enabled: true,
                temp_dir: f.temp_dir.join("unbounded"),
                chunk_size: 1,
                max_file_size: 0,
                session_timeout_secs: 3600,
                sweep_interval_secs: 0,
            },
            f.store.clone(),
        )
        .await
        .unwrap();

        assert!(matches!(
            manager.initialize_upload(init(4_294_967_298)).await,
            Err(UploadError::TooManyChunks {
                size: 4_294_967_298,
                chunk_size: 1
            })
        ));
        assert_eq!(manager.active_uploads_count(), 0);

        let session = manager.initialize_upload(init(10)).await.unwrap();
        assert_eq!(session.total_chunks, 10);
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let f = fixture().await;
        assert!(matches!(
            f.manager.initialize_upload(init(0)).await,
            Err(UploadError::InvalidSize { .. })
        ));
        assert!(matches!(
            f.manager.initialize_upload(init(4096)).await,
            Err(UploadError::InvalidSize { .. })
        ));

        let id = f.manager.initialize_upload(init(10)).await.unwrap().upload_id;
        assert!(matches!(
            f.manager.upload_chunk(&id, 3, chunk(b"x")).await,
            Err(UploadError::ChunkOutOfRange { index: 3, total: 3 })
        ));
        assert!(matches!(
            f.manager.upload_chunk(&id, 0, Bytes::new()).await,
            Err(UploadError::EmptyChunk)
        ));
        assert!(matches!(
            f.manager.upload_chunk("nope", 0, chunk(b"x")).await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_size_mismatch_creates_no_object() {
        let f = fixture().await;
        let id = f.manager.initialize_upload(init(10)).await.unwrap().upload_id;
        f.manager.upload_chunk(&id, 0, chunk(b"ABCD")).await.unwrap();
        f.manager.upload_chunk(&id, 1, chunk(b"EFGH")).await.unwrap();
        let err = f.manager.upload_chunk(&id, 2, chunk(b"J")).await.unwrap_err();

        assert!(matches!(
            err,
            UploadError::SizeMismatch { expected: 10, actual: 9 }
        ));
        assert_eq!(f.store.file_count(), 0);
        let session = f.manager.get_upload(&id).await.unwrap();
        assert_eq!(session.state, UploadState::Open);
        assert!(f.temp_dir.join(&id).exists());
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_dropped_and_can_be_resent() {
        let f = fixture().await;
        let id = f.manager.initialize_upload(init(10)).await.unwrap().upload_id;
        f.manager.upload_chunk(&id, 0, chunk(b"ABCD")).await.unwrap();
        f.manager.upload_chunk(&id, 1, chunk(b"EFGH")).await.unwrap();
        fs::write(chunk_path(&f.temp_dir.join(&id), 0), b"XXXX")
            .await
            .unwrap();

        let err = f.manager.upload_chunk(&id, 2, chunk(b"JK")).await.unwrap_err();
        assert!(matches!(err, UploadError::ChecksumMismatch(0)));
        assert_eq!(f.manager.missing_chunks(&id).await.unwrap(), vec![0]);

        let outcome = f.manager.upload_chunk(&id, 0, chunk(b"ABCD")).await.unwrap();
        let ChunkOutcome::Completed { object_id } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        let data = f.store.get_data(&object_id).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"ABCDEFGHJK");
    }

    #[tokio::test]
    async fn test_failed_store_is_retried_by_resending_a_chunk() {
        let f = fixture_with(64, 3600).await;
        let mut blocker = StoreRequest {
            filename: "blocker.bin".into(),
            data: Bytes::from(vec![0u8; 60]),
            ..Default::default()
        };
        blocker.uploader_ip = "local".into();
        let blocker = f.store.store(blocker).await.unwrap();

        let id = f.manager.initialize_upload(init(10)).await.unwrap().upload_id;
        f.manager.upload_chunk(&id, 0, chunk(b"ABCD")).await.unwrap();
        f.manager.upload_chunk(&id, 1, chunk(b"EFGH")).await.unwrap();
        let err = f.manager.upload_chunk(&id, 2, chunk(b"JK")).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Store(StoreError::CapacityExceeded { .. })
        ));
        assert_eq!(
            f.manager.get_upload(&id).await.unwrap().state,
            UploadState::Open
        );

        assert!(f.store.delete(&blocker.id).await);
        let outcome = f.manager.upload_chunk(&id, 1, chunk(b"EFGH")).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));

        let object_id = f.manager.finalize_upload(&id).await.unwrap();
        assert_eq!(
            Some(object_id),
            f.manager.get_upload(&id).await.unwrap().final_file_id
        );
    }

    #[tokio::test]
    async fn test_finalize_requires_all_chunks() {
        let f = fixture().await;
        let id = f.manager.initialize_upload(init(10)).await.unwrap().upload_id;
        f.manager.upload_chunk(&id, 0, chunk(b"ABCD")).await.unwrap();
        assert!(matches!(
            f.manager.finalize_upload(&id).await,
            Err(UploadError::MissingChunk(1))
        ));
    }

    #[tokio::test]
    async fn test_cancel_purges_scratch() {
        let f = fixture().await;
        let id = f.manager.initialize_upload(init(10)).await.unwrap().upload_id;
        f.manager.upload_chunk(&id, 0, chunk(b"ABCD")).await.unwrap();
        assert!(f.temp_dir.join(&id).exists());

        assert!(f.manager.cancel_upload(&id).await);
        assert!(!f.manager.cancel_upload(&id).await);
        assert!(!f.temp_dir.join(&id).exists());
        assert!(f.manager.get_upload(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_discarded() {
        let f = fixture_with(0, 1).await;
        let a = f.manager.initialize_upload(init(10)).await.unwrap().upload_id;
        let b = f.manager.initialize_upload(init(10)).await.unwrap().upload_id;
        f.manager.upload_chunk(&a, 0, chunk(b"ABCD")).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(1100)).await;
        assert!(matches!(
            f.manager.upload_chunk(&a, 1, chunk(b"EFGH")).await,
            Err(UploadError::SessionExpired(_))
        ));
        assert!(!f.temp_dir.join(&a).exists());

        assert_eq!(f.manager.cleanup_expired_uploads().await, 1);
        assert!(f.manager.get_upload(&b).await.is_none());
        assert!(f.manager.active_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_scratch_is_purged_on_startup() {
        let tmp = TempDir::new().unwrap();
        let temp_dir = tmp.path().join("uploads");
        let stale = temp_dir.join("stale-session");
        fs::create_dir_all(&stale).await.unwrap();
        fs::write(stale.join("chunk_0000000000"), b"old").await.unwrap();

        let storage = StorageConfig {
            storage_dir: tmp.path().join("storage"),
            cleanup_interval_secs: 0,
            cache_sweep_interval_secs: 0,
            ..Default::default()
        };
        let store = BlobStore::open(storage, Arc::new(FixedProbe(u64::MAX)))
            .await
            .unwrap();
        let manager = ChunkedUploadManager::new(
            ChunkedUploadConfig {
                temp_dir: temp_dir.clone(),
                sweep_interval_secs: 0,
                ..Default::default()
            },
            store,
        )
        .await
        .unwrap();

        assert!(!stale.exists());
        assert!(temp_dir.exists());
        manager.shutdown().await;
    }

    #[test]
    fn test_chunk_paths_sort_numerically() {
        let dir = Path::new("/tmp/u");
        let mut names: Vec<_> = [10u32, 2, 100, 1]
            .iter()
            .map(|i| chunk_path(dir, *i))
            .collect();
        names.sort();
        let order: Vec<_> = names
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            order,
            vec![
                "chunk_0000000001",
                "chunk_0000000002",
                "chunk_0000000010",
                "chunk_0000000100"
            ]
        );
    }
}
