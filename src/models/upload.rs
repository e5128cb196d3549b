//! Represents resumable chunked upload sessions and their received chunks.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Lifecycle of a session while it is registered with the manager.
///
/// Cancelled and expired sessions are removed outright, so they have no
/// variant here.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Open,
    Finalizing,
    Completed,
}

/// Ledger entry for one accepted chunk.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub index: u32,
    pub size: u64,
    /// Hex SHA-256 of the chunk bytes as received.
    pub checksum: String,
    pub received_at: DateTime<Utc>,
}

/// Parameters for opening a new chunked upload.
#[derive(Clone, Debug, Default)]
pub struct InitUpload {
    pub filename: String,
    pub total_size: u64,
    pub is_public: bool,
    pub ttl_seconds: Option<u64>,
    pub metadata: BTreeMap<String, String>,
    pub uploader_ip: String,
    pub uploader_agent: String,
}

/// An in-progress (or completed) chunked upload.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    #[serde(rename = "public")]
    pub is_public: bool,
    pub ttl_seconds: Option<u64>,
    pub metadata: BTreeMap<String, String>,
    pub uploader_ip: String,
    pub uploader_agent: String,
    pub created_at: DateTime<Utc>,
    /// Deadline for completing the upload; unrelated to the object TTL.
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub chunks: HashMap<u32, ChunkInfo>,
    pub uploaded_bytes: u64,
    pub state: UploadState,
    pub final_file_id: Option<String>,
}

impl UploadSession {
    /// `total_chunks` comes from [`chunk_count`] for the declared size.
    pub fn new(
        upload_id: String,
        req: InitUpload,
        chunk_size: u64,
        total_chunks: u32,
        window: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            upload_id,
            total_chunks,
            filename: req.filename,
            total_size: req.total_size,
            chunk_size,
            is_public: req.is_public,
            ttl_seconds: req.ttl_seconds,
            metadata: req.metadata,
            uploader_ip: req.uploader_ip,
            uploader_agent: req.uploader_agent,
            created_at,
            expires_at: created_at + window,
            chunks: HashMap::new(),
            uploaded_bytes: 0,
            state: UploadState::Open,
            final_file_id: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_completed(&self) -> bool {
        self.state == UploadState::Completed
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.chunks.contains_key(&index)
    }

    /// Record an accepted chunk. Returns `false` if the index was already
    /// present, leaving the ledger untouched.
    pub fn record_chunk(&mut self, index: u32, size: u64, checksum: String) -> bool {
        if self.chunks.contains_key(&index) {
            return false;
        }
        self.chunks.insert(
            index,
            ChunkInfo {
                index,
                size,
                checksum,
                received_at: Utc::now(),
            },
        );
        self.uploaded_bytes += size;
        true
    }

    /// Drop a chunk from the ledger so it must be re-sent.
    pub fn forget_chunk(&mut self, index: u32) {
        if let Some(info) = self.chunks.remove(&index) {
            self.uploaded_bytes = self.uploaded_bytes.saturating_sub(info.size);
        }
    }

    /// Every chunk index has been received.
    pub fn ledger_complete(&self) -> bool {
        self.chunks.len() == self.total_chunks as usize
    }

    /// Chunk indices not yet received, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.chunks.contains_key(index))
            .collect()
    }

    pub fn received_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Percent of declared bytes received.
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        self.uploaded_bytes as f64 / self.total_size as f64 * 100.0
    }
}

/// `ceil(total_size / chunk_size)`, or `None` when the count does not fit
/// a chunk index.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(total_size.div_ceil(chunk_size)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: u64, chunk: u64) -> UploadSession {
        UploadSession::new(
            "u1".into(),
            InitUpload {
                filename: "big.bin".into(),
                total_size: total,
                ..Default::default()
            },
            chunk,
            chunk_count(total, chunk).unwrap(),
            Duration::hours(1),
        )
    }

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(chunk_count(10, 4), Some(3));
        assert_eq!(chunk_count(8, 4), Some(2));
        assert_eq!(chunk_count(1, 4), Some(1));
    }

    #[test]
    fn test_chunk_count_overflow() {
        assert_eq!(chunk_count(u64::from(u32::MAX), 1), Some(u32::MAX));
        assert_eq!(chunk_count(u64::from(u32::MAX) + 1, 1), None);
        assert_eq!(chunk_count(4_294_967_298, 1), None);
        assert_eq!(chunk_count(10, 0), None);
    }

    #[test]
    fn test_record_chunk_is_idempotent() {
        let mut s = session(10, 4);
        assert!(s.record_chunk(0, 4, "aa".into()));
        assert!(!s.record_chunk(0, 2, "bb".into()));
        assert_eq!(s.uploaded_bytes, 4);
        assert_eq!(s.chunks[&0].checksum, "aa");
        assert_eq!(s.missing_chunks(), vec![1, 2]);
    }

    #[test]
    fn test_ledger_completion_and_progress() {
        let mut s = session(10, 4);
        s.record_chunk(2, 2, "c".into());
        s.record_chunk(0, 4, "a".into());
        assert!(!s.ledger_complete());
        s.record_chunk(1, 4, "b".into());
        assert!(s.ledger_complete());
        assert_eq!(s.progress(), 100.0);

        s.forget_chunk(1);
        assert_eq!(s.uploaded_bytes, 6);
        assert_eq!(s.missing_chunks(), vec![1]);
    }

    #[test]
    fn test_session_window() {
        let s = session(10, 4);
        assert!(!s.is_expired());
        assert_eq!(s.expires_at - s.created_at, Duration::hours(1));
        assert_eq!(s.state, UploadState::Open);
    }
}
