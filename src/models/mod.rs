//! Core data models for the blob store.
//!
//! These entities describe stored objects, their persisted index records and
//! sidecar metadata, and chunked upload sessions. They serialize naturally as
//! JSON via `serde`.

pub mod metadata;
pub mod object;
pub mod upload;

pub use object::{IndexEntry, StoredObject};
pub use upload::{ChunkInfo, InitUpload, UploadSession, UploadState};
