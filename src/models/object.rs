//! Represents a stored object (blob) and the index record that locates it on disk.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// A single object as returned to callers.
///
/// `data` holds the decompressed payload for reads and is empty when the
/// object comes from a listing.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Globally unique identifier, generated at store time.
    pub id: String,

    /// Original filename supplied by the uploader.
    pub filename: String,

    /// Lowercased extension derived from `filename` (empty when none).
    pub extension: String,

    #[serde(skip)]
    pub data: Bytes,

    /// Size on disk (post-compression).
    pub size: u64,

    /// Size before compression.
    pub original_size: u64,

    #[serde(rename = "public")]
    pub is_public: bool,

    pub uploaded_at: DateTime<Utc>,

    /// `None` means the object never expires.
    pub expires_at: Option<DateTime<Utc>>,

    pub compressed: bool,

    pub uploader_ip: String,

    pub uploader_agent: String,

    /// Free-form metadata: tags, category, uploader, description and custom keys.
    pub metadata: BTreeMap<String, String>,
}

impl StoredObject {
    pub fn mime_type(&self) -> &'static str {
        mime_type_for(&self.extension)
    }

    pub fn is_expired(&self) -> bool {
        is_expired_at(self.expires_at, Utc::now())
    }

    /// Seconds until expiry, `None` for objects without a TTL.
    pub fn time_to_live(&self) -> Option<i64> {
        self.expires_at
            .map(|at| at.timestamp() - Utc::now().timestamp())
    }

    pub fn tags(&self) -> &str {
        self.metadata_or("tags", "")
    }

    pub fn description(&self) -> &str {
        self.metadata_or("description", "")
    }

    pub fn category(&self) -> &str {
        self.metadata_or("category", "general")
    }

    pub fn uploader(&self) -> &str {
        self.metadata_or("uploader", "anonymous")
    }

    fn metadata_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.metadata.get(key).map(String::as_str).unwrap_or(default)
    }
}

/// Persisted, authoritative record for one object.
///
/// Field names follow the on-disk index format so existing index files keep
/// loading.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub original_size: u64,
    pub is_public: bool,
    pub is_compressed: bool,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub uploader_ip: String,
    pub uploader_agent: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Payload location relative to the storage directory (`{id}_{filename}`).
    pub disk_path: String,
}

impl IndexEntry {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired_at(self.expires_at, now)
    }

    pub fn extension(&self) -> String {
        file_extension(&self.filename)
    }

    /// Build the caller-facing view, attaching `data` as the payload.
    pub fn to_stored_object(&self, data: Bytes) -> StoredObject {
        StoredObject {
            id: self.id.clone(),
            filename: self.filename.clone(),
            extension: self.extension(),
            data,
            size: self.size,
            original_size: self.original_size,
            is_public: self.is_public,
            uploaded_at: self.uploaded_at,
            expires_at: self.expires_at,
            compressed: self.is_compressed,
            uploader_ip: self.uploader_ip.clone(),
            uploader_agent: self.uploader_agent.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

fn is_expired_at(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_some_and(|at| now > at)
}

/// Lowercased text after the last `.`, or empty.
pub fn file_extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Static extension → MIME table.
pub fn mime_type_for(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "wav" => "audio/wav",
        "avi" => "video/avi",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => DEFAULT_MIME_TYPE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(expires_at: Option<DateTime<Utc>>) -> IndexEntry {
        IndexEntry {
            id: "abc123".into(),
            filename: "Report.PDF".into(),
            size: 10,
            original_size: 20,
            is_public: true,
            is_compressed: true,
            mime_type: "application/pdf".into(),
            uploaded_at: Utc::now(),
            expires_at,
            uploader_ip: "127.0.0.1".into(),
            uploader_agent: "test".into(),
            metadata: BTreeMap::from([("category".to_string(), "docs".to_string())]),
            disk_path: "abc123_Report.PDF".into(),
        }
    }

    #[test]
    fn test_extension_and_mime() {
        assert_eq!(file_extension("photo.JPG"), "jpg");
        assert_eq!(file_extension("archive.tar.gz"), "gz");
        assert_eq!(file_extension("README"), "");
        assert_eq!(mime_type_for("jpg"), "image/jpeg");
        assert_eq!(mime_type_for("unknown"), DEFAULT_MIME_TYPE);
        assert_eq!(mime_type_for(""), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn test_expiry_predicate() {
        let now = Utc::now();
        assert!(!entry(None).is_expired_at(now));
        assert!(!entry(Some(now + Duration::seconds(5))).is_expired_at(now));
        assert!(entry(Some(now - Duration::seconds(5))).is_expired_at(now));
    }

    #[test]
    fn test_to_stored_object_defaults() {
        let obj = entry(None).to_stored_object(Bytes::new());
        assert_eq!(obj.extension, "pdf");
        assert_eq!(obj.mime_type(), "application/pdf");
        assert_eq!(obj.category(), "docs");
        assert_eq!(obj.uploader(), "anonymous");
        assert_eq!(obj.tags(), "");
        assert!(obj.time_to_live().is_none());
        assert!(obj.data.is_empty());
    }

    #[test]
    fn test_index_entry_json_field_names() {
        let json = serde_json::to_value(entry(None)).unwrap();
        assert!(json.get("originalSize").is_some());
        assert!(json.get("isCompressed").is_some());
        assert!(json.get("diskPath").is_some());

        let back: IndexEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.disk_path, "abc123_Report.PDF");
    }
}
