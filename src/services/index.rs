//! In-memory object index and its on-disk persistence.
//!
//! The index is serialized to `file_index.json` inside the storage directory.
//! When that file is missing or unreadable the directory is rescanned and the
//! index rebuilt from payload names (`{id}_{filename}`) plus sidecar files.

use crate::models::{
    IndexEntry,
    metadata::{SIDECAR_SUFFIX, SidecarRecord},
    object::{file_extension, mime_type_for},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::Path,
};
use tokio::fs;
use tracing::{debug, info, warn};

use super::fsutil::write_atomic;

pub const INDEX_FILE_NAME: &str = "file_index.json";

/// Prefix of in-flight temporary files; never indexed.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Serialized form of the whole index.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    files: Vec<IndexEntry>,
    last_updated: DateTime<Utc>,
    total_files: usize,
    total_storage: u64,
}

/// How the index was obtained at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSource {
    /// Read from `file_index.json`; `pruned` entries pointed at missing payloads.
    IndexFile { pruned: usize },
    Rescan,
}

impl IndexSource {
    /// Whether the loaded entries differ from what is on disk in the index file.
    pub fn needs_persist(self) -> bool {
        match self {
            IndexSource::IndexFile { pruned } => pruned > 0,
            IndexSource::Rescan => true,
        }
    }
}

/// Concurrent directory of all known objects keyed by id.
#[derive(Default)]
pub struct ObjectIndex {
    entries: DashMap<String, IndexEntry>,
}

impl ObjectIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = IndexEntry>) -> Self {
        let index = Self::new();
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    pub fn get(&self, id: &str) -> Option<IndexEntry> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&self, entry: IndexEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn remove(&self, id: &str) -> Option<IndexEntry> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Owned copy of every entry.
    pub fn snapshot(&self) -> Vec<IndexEntry> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn expired_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Sum of on-disk sizes.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|entry| entry.value().size).sum()
    }
}

/// Load entries from the index file, falling back to a rescan.
///
/// Entries whose payload file no longer exists are pruned.
pub async fn load(dir: &Path) -> io::Result<(Vec<IndexEntry>, IndexSource)> {
    let index_path = dir.join(INDEX_FILE_NAME);
    let text = match fs::read_to_string(&index_path).await {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("No existing index file found, scanning storage directory...");
            return Ok((scan_directory(dir).await?, IndexSource::Rescan));
        }
        Err(err) => {
            warn!("Failed to read index file {}: {}", index_path.display(), err);
            return Ok((scan_directory(dir).await?, IndexSource::Rescan));
        }
    };

    let parsed: IndexFile = match serde_json::from_str(&text) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("Failed to parse index file, rebuilding from disk: {}", err);
            return Ok((scan_directory(dir).await?, IndexSource::Rescan));
        }
    };

    let mut entries = Vec::with_capacity(parsed.files.len());
    let mut pruned = 0;
    for entry in parsed.files {
        if !is_plain_file_name(&entry.disk_path) {
            warn!("Ignoring index entry {} with unsafe path {}", entry.id, entry.disk_path);
            pruned += 1;
            continue;
        }
        match fs::try_exists(dir.join(&entry.disk_path)).await {
            Ok(true) => entries.push(entry),
            Ok(false) => {
                warn!("File missing from disk: {}", entry.disk_path);
                pruned += 1;
            }
            Err(err) => {
                warn!("Cannot stat {}: {}", entry.disk_path, err);
                pruned += 1;
            }
        }
    }
    Ok((entries, IndexSource::IndexFile { pruned }))
}

/// Write the index atomically.
pub async fn save(dir: &Path, entries: Vec<IndexEntry>, total_storage: u64) -> io::Result<()> {
    let file = IndexFile {
        total_files: entries.len(),
        files: entries,
        last_updated: Utc::now(),
        total_storage,
    };
    let json = serde_json::to_vec_pretty(&file).map_err(io::Error::other)?;
    write_atomic(&dir.join(INDEX_FILE_NAME), &json).await
}

/// Rebuild entries from the payload files present in `dir`.
pub async fn scan_directory(dir: &Path) -> io::Result<Vec<IndexEntry>> {
    info!("Scanning storage directory {} for files...", dir.display());
    let now = Utc::now();
    let mut entries = Vec::new();
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(entries),
        Err(err) => return Err(err),
    };

    while let Some(dirent) = reader.next_entry().await? {
        let file_name = dirent.file_name().to_string_lossy().into_owned();
        if !is_payload_candidate(&file_name) {
            continue;
        }
        let meta = match dirent.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(err) => {
                warn!("Failed to index file {}: {}", file_name, err);
                continue;
            }
        };
        let sidecar_path = dir.join(format!("{}{}", file_name, SIDECAR_SUFFIX));
        let sidecar = match fs::read_to_string(&sidecar_path).await {
            Ok(text) => Some(text),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                warn!("Failed to read sidecar {}: {}", sidecar_path.display(), err);
                None
            }
        };

        match entry_from_disk_file(&file_name, meta.len(), sidecar.as_deref(), now) {
            Some(entry) => entries.push(entry),
            None => debug!("Skipping {}: not an `{{id}}_{{name}}` payload", file_name),
        }
    }

    info!(
        "Scanned {} files ({} bytes total)",
        entries.len(),
        entries.iter().map(|entry| entry.size).sum::<u64>()
    );
    Ok(entries)
}

/// Best-effort index entry for one payload file.
///
/// `file_name` must follow `{id}_{filename}`; anything else yields `None`.
/// Missing sidecar values fall back to defaults: private, uncompressed,
/// original size equal to `size`, uploaded `now`, never expiring.
pub fn entry_from_disk_file(
    file_name: &str,
    size: u64,
    sidecar: Option<&str>,
    now: DateTime<Utc>,
) -> Option<IndexEntry> {
    let (id, filename) = file_name.split_once('_')?;
    if id.is_empty() || filename.is_empty() {
        return None;
    }

    let record = sidecar.map(SidecarRecord::decode).unwrap_or_default();
    let mime_type = if sidecar.is_some() {
        record.mime_type
    } else {
        mime_type_for(&file_extension(filename)).to_string()
    };

    Some(IndexEntry {
        id: id.to_string(),
        filename: filename.to_string(),
        size,
        original_size: record.original_size.unwrap_or(size),
        is_public: record.is_public,
        is_compressed: record.compressed,
        mime_type,
        uploaded_at: record.uploaded_at.unwrap_or(now),
        expires_at: record.expires_at,
        uploader_ip: record.uploader_ip,
        uploader_agent: record.uploader_agent,
        metadata: record.custom,
        disk_path: file_name.to_string(),
    })
}

fn is_payload_candidate(file_name: &str) -> bool {
    file_name != INDEX_FILE_NAME
        && !file_name.ends_with(SIDECAR_SUFFIX)
        && !file_name.starts_with(TEMP_PREFIX)
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_entry_from_disk_file_without_sidecar() {
        let now = Utc::now();
        let entry = entry_from_disk_file("a1b2c3_my_photo.png", 321, None, now).unwrap();
        assert_eq!(entry.id, "a1b2c3");
        assert_eq!(entry.filename, "my_photo.png");
        assert_eq!(entry.size, 321);
        assert_eq!(entry.original_size, 321);
        assert_eq!(entry.mime_type, "image/png");
        assert_eq!(entry.uploaded_at, now);
        assert!(!entry.is_public);
        assert_eq!(entry.disk_path, "a1b2c3_my_photo.png");
    }

    #[test]
    fn test_entry_from_disk_file_with_sidecar() {
        let sidecar = "public=true\ncompressed=true\noriginalSize=900\n\
                       uploadedAt=2024-02-02T00:00:00Z\nexpiresAt=null\n\
                       uploaderIp=9.9.9.9\nuploaderAgent=agent\nmimeType=text/plain\ntags=x\n";
        let entry = entry_from_disk_file("id9_notes.txt", 100, Some(sidecar), Utc::now()).unwrap();
        assert!(entry.is_public);
        assert!(entry.is_compressed);
        assert_eq!(entry.original_size, 900);
        assert_eq!(entry.uploader_ip, "9.9.9.9");
        assert_eq!(entry.metadata.get("tags").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_entry_from_disk_file_rejects_bad_names() {
        let now = Utc::now();
        assert!(entry_from_disk_file("noseparator", 1, None, now).is_none());
        assert!(entry_from_disk_file("_name", 1, None, now).is_none());
        assert!(entry_from_disk_file("id_", 1, None, now).is_none());
    }

    #[tokio::test]
    async fn test_scan_skips_index_sidecars_and_temp_files() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        fs::write(dir.join("abc_data.bin"), b"12345").await.unwrap();
        fs::write(dir.join("abc_data.bin.meta"), b"public=true\n").await.unwrap();
        fs::write(dir.join(INDEX_FILE_NAME), b"{}").await.unwrap();
        fs::write(dir.join(".tmp-123"), b"partial").await.unwrap();
        fs::write(dir.join("stray"), b"x").await.unwrap();

        let entries = scan_directory(dir).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "abc");
        assert_eq!(entries[0].size, 5);
        assert!(entries[0].is_public);
    }

    #[tokio::test]
    async fn test_corrupt_index_triggers_rescan() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        fs::write(dir.join("id1_a.txt"), b"hello").await.unwrap();
        fs::write(dir.join(INDEX_FILE_NAME), b"{ not json").await.unwrap();

        let (entries, source) = load(dir).await.unwrap();
        assert_eq!(source, IndexSource::Rescan);
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_save_then_load_prunes_missing_payloads() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        fs::write(dir.join("keep_a.txt"), b"a").await.unwrap();

        let now = Utc::now();
        let keep = entry_from_disk_file("keep_a.txt", 1, None, now).unwrap();
        let gone = entry_from_disk_file("gone_b.txt", 1, None, now).unwrap();
        save(dir, vec![keep, gone], 2).await.unwrap();

        let (entries, source) = load(dir).await.unwrap();
        assert_eq!(source, IndexSource::IndexFile { pruned: 1 });
        assert!(source.needs_persist());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "keep");

        save(dir, entries, 1).await.unwrap();
        let (_, source) = load(dir).await.unwrap();
        assert_eq!(source, IndexSource::IndexFile { pruned: 0 });
        assert!(!source.needs_persist());
    }

    #[test]
    fn test_object_index_basics() {
        let now = Utc::now();
        let mut expired = entry_from_disk_file("old_x.bin", 4, None, now).unwrap();
        expired.expires_at = Some(now - chrono::Duration::seconds(1));
        let fresh = entry_from_disk_file("new_y.bin", 6, None, now).unwrap();

        let index = ObjectIndex::from_entries([expired, fresh]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.total_size(), 10);
        assert_eq!(index.expired_ids(now), vec!["old".to_string()]);
        assert!(index.remove("old").is_some());
        assert!(!index.contains("old"));
    }
}
