//! Sidecar metadata records stored next to each payload as `{disk_path}.meta`.
//!
//! The format is one `key=value` pair per line. System keys come first
//! (`public`, `compressed`, `originalSize`, `uploadedAt`, `expiresAt`,
//! `uploaderIp`, `uploaderAgent`, `mimeType`), followed by custom metadata.
//! Backslash, CR and LF are escaped in keys and values, and `=` is escaped
//! in keys, so arbitrary custom metadata survives a round-trip.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

use super::object::DEFAULT_MIME_TYPE;

pub const SIDECAR_SUFFIX: &str = ".meta";

const KEY_PUBLIC: &str = "public";
const KEY_COMPRESSED: &str = "compressed";
const KEY_ORIGINAL_SIZE: &str = "originalSize";
const KEY_UPLOADED_AT: &str = "uploadedAt";
const KEY_EXPIRES_AT: &str = "expiresAt";
const KEY_UPLOADER_IP: &str = "uploaderIp";
const KEY_UPLOADER_AGENT: &str = "uploaderAgent";
const KEY_MIME_TYPE: &str = "mimeType";

/// Keys owned by the sidecar format itself; custom metadata cannot use them.
pub const RESERVED_KEYS: [&str; 8] = [
    KEY_PUBLIC,
    KEY_COMPRESSED,
    KEY_ORIGINAL_SIZE,
    KEY_UPLOADED_AT,
    KEY_EXPIRES_AT,
    KEY_UPLOADER_IP,
    KEY_UPLOADER_AGENT,
    KEY_MIME_TYPE,
];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Decoded contents of a sidecar file.
///
/// Fields that a sidecar may omit are optional or carry the defaults used
/// when rebuilding the index from disk.
#[derive(Clone, Debug, PartialEq)]
pub struct SidecarRecord {
    pub is_public: bool,
    pub compressed: bool,
    pub original_size: Option<u64>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub uploader_ip: String,
    pub uploader_agent: String,
    pub mime_type: String,
    pub custom: BTreeMap<String, String>,
}

impl Default for SidecarRecord {
    fn default() -> Self {
        Self {
            is_public: false,
            compressed: false,
            original_size: None,
            uploaded_at: None,
            expires_at: None,
            uploader_ip: "unknown".into(),
            uploader_agent: "unknown".into(),
            mime_type: DEFAULT_MIME_TYPE.into(),
            custom: BTreeMap::new(),
        }
    }
}

impl SidecarRecord {
    /// Render the record as `key=value` lines.
    ///
    /// Custom keys that collide with a reserved key are skipped; the index
    /// file still carries them.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        push_line(&mut out, KEY_PUBLIC, &self.is_public.to_string());
        push_line(&mut out, KEY_COMPRESSED, &self.compressed.to_string());
        push_line(
            &mut out,
            KEY_ORIGINAL_SIZE,
            &self.original_size.unwrap_or(0).to_string(),
        );
        let uploaded_at = self.uploaded_at.unwrap_or_else(Utc::now);
        push_line(&mut out, KEY_UPLOADED_AT, &format_instant(uploaded_at));
        let expires_at = self
            .expires_at
            .map(format_instant)
            .unwrap_or_else(|| "null".to_string());
        push_line(&mut out, KEY_EXPIRES_AT, &expires_at);
        push_line(&mut out, KEY_UPLOADER_IP, &self.uploader_ip);
        push_line(&mut out, KEY_UPLOADER_AGENT, &self.uploader_agent);
        push_line(&mut out, KEY_MIME_TYPE, &self.mime_type);

        for (key, value) in &self.custom {
            if is_reserved_key(key) {
                tracing::debug!("sidecar skips custom key `{}` shadowing a system key", key);
                continue;
            }
            push_line(&mut out, key, value);
        }
        out
    }

    /// Parse sidecar text, best-effort.
    ///
    /// Lines without `=` are ignored, and unparsable system values keep
    /// their defaults.
    pub fn decode(text: &str) -> Self {
        let mut record = Self::default();
        for line in text.lines() {
            let Some((key, value)) = split_line(line) else {
                continue;
            };
            match key.as_str() {
                KEY_PUBLIC => record.is_public = value.eq_ignore_ascii_case("true"),
                KEY_COMPRESSED => record.compressed = value.eq_ignore_ascii_case("true"),
                KEY_ORIGINAL_SIZE => record.original_size = value.trim().parse().ok(),
                KEY_UPLOADED_AT => record.uploaded_at = parse_instant(&value),
                KEY_EXPIRES_AT => record.expires_at = parse_instant(&value),
                KEY_UPLOADER_IP => record.uploader_ip = value,
                KEY_UPLOADER_AGENT => record.uploader_agent = value,
                KEY_MIME_TYPE => record.mime_type = value,
                _ => {
                    record.custom.insert(key, value);
                }
            }
        }
        record
    }
}

/// ISO-8601 instant in UTC with a `Z` suffix.
pub fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value == "null" {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn push_line(out: &mut String, key: &str, value: &str) {
    escape_into(out, key, true);
    out.push('=');
    escape_into(out, value, false);
    out.push('\n');
}

fn escape_into(out: &mut String, text: &str, is_key: bool) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '=' if is_key => out.push_str("\\="),
            other => out.push(other),
        }
    }
}

/// Split on the first unescaped `=` and unescape both halves.
///
/// Only the sequences [`escape_into`] writes are decoded; any other
/// backslash is kept verbatim so unescaped sidecars read back unchanged.
fn split_line(line: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut chars = line.chars().peekable();
    loop {
        match chars.next()? {
            '\\' => match chars.peek() {
                Some('=') => {
                    key.push('=');
                    chars.next();
                }
                Some(&next) => match unescaped(next) {
                    Some(c) => {
                        key.push(c);
                        chars.next();
                    }
                    None => key.push('\\'),
                },
                None => return None,
            },
            '=' => break,
            other => key.push(other),
        }
    }
    if key.is_empty() {
        return None;
    }

    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c != '\\' {
            value.push(c);
            continue;
        }
        match chars.peek().copied().and_then(unescaped) {
            Some(decoded) => {
                value.push(decoded);
                chars.next();
            }
            None => value.push('\\'),
        }
    }
    Some((key, value))
}

fn unescaped(c: char) -> Option<char> {
    match c {
        '\\' => Some('\\'),
        'n' => Some('\n'),
        'r' => Some('\r'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> SidecarRecord {
        SidecarRecord {
            is_public: true,
            compressed: true,
            original_size: Some(4096),
            uploaded_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()),
            expires_at: None,
            uploader_ip: "10.0.0.7".into(),
            uploader_agent: "curl/8.0".into(),
            mime_type: "text/plain".into(),
            custom: BTreeMap::from([
                ("tags".to_string(), "a,b".to_string()),
                ("multi=line".to_string(), "first\nsecond\\third".to_string()),
            ]),
        }
    }

    #[test]
    fn test_encode_layout() {
        let text = sample().encode();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "public=true");
        assert_eq!(lines[1], "compressed=true");
        assert_eq!(lines[2], "originalSize=4096");
        assert_eq!(lines[3], "uploadedAt=2024-05-01T12:30:00Z");
        assert_eq!(lines[4], "expiresAt=null");
        assert_eq!(lines[7], "mimeType=text/plain");
        assert!(text.contains("multi\\=line=first\\nsecond\\\\third"));
    }

    #[test]
    fn test_custom_metadata_survives_round_trip() {
        let record = sample();
        assert_eq!(SidecarRecord::decode(&record.encode()), record);
    }

    #[test]
    fn test_decode_plain_legacy_file() {
        let text = "public=false\ncompressed=false\noriginalSize=12\n\
                    uploadedAt=2024-01-02T03:04:05.123Z\nexpiresAt=2024-01-03T03:04:05Z\n\
                    uploaderIp=1.2.3.4\nuploaderAgent=unknown\nmimeType=image/png\n\
                    category=photos\ngarbage line\n";
        let record = SidecarRecord::decode(text);
        assert!(!record.is_public);
        assert_eq!(record.original_size, Some(12));
        assert!(record.expires_at.is_some());
        assert_eq!(record.mime_type, "image/png");
        assert_eq!(record.custom.get("category").map(String::as_str), Some("photos"));
        assert_eq!(record.custom.len(), 1);
    }

    #[test]
    fn test_decode_keeps_unknown_backslash_sequences() {
        let text = "uploaderAgent=Mozilla\\x (C:\\Users\\bob)\n\
                    path\\to=C:\\temp\\dir\n\
                    note=line\\nbreak and \\\\ slash\n";
        let record = SidecarRecord::decode(text);
        assert_eq!(record.uploader_agent, "Mozilla\\x (C:\\Users\\bob)");
        assert_eq!(
            record.custom.get("path\\to").map(String::as_str),
            Some("C:\\temp\\dir")
        );
        assert_eq!(
            record.custom.get("note").map(String::as_str),
            Some("line\nbreak and \\ slash")
        );
    }

    #[test]
    fn test_reserved_custom_key_is_not_written() {
        let mut record = sample();
        record.custom.insert("public".into(), "false".into());
        let decoded = SidecarRecord::decode(&record.encode());
        assert!(decoded.is_public);
        assert!(!decoded.custom.contains_key("public"));
    }
}
