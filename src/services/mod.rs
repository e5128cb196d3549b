//! Storage engine and chunked upload services.

pub mod blob_store;
pub mod cache;
pub mod chunked_upload;
pub mod compression;
pub mod fsutil;
pub mod index;
pub mod tasks;

pub use blob_store::{BlobStore, ListQuery, StoreError, StoreRequest, StoreResult};
pub use chunked_upload::{ChunkOutcome, ChunkedUploadManager, UploadError, UploadResult};
pub use compression::{ResourceProbe, SystemMemoryProbe};
