//! Single-node blob storage with quotas, expiry, transparent compression and
//! resumable chunked uploads, plus a thin `axum` HTTP surface.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
