use anyhow::{Context, Result};
use blob_store::{
    config::AppConfig,
    routes::{self, AppState},
    services::{BlobStore, ChunkedUploadManager, SystemMemoryProbe},
};
use std::{io::ErrorKind, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("blob_store=info")),
        )
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting blob-store with config: {:?}", cfg.storage);

    if cfg.server.access_key.is_none() {
        tracing::warn!("No access key configured; protected routes are open to everyone");
    }

    // --- Initialize core services ---
    let probe = Arc::new(SystemMemoryProbe::new(Some(cfg.storage.max_ram)));
    let store = BlobStore::open(cfg.storage.clone(), probe)
        .await
        .context("failed to open blob store")?;

    let uploads = if cfg.uploads.enabled {
        Some(
            ChunkedUploadManager::new(cfg.uploads.clone(), store.clone())
                .await
                .context("failed to initialize chunked uploads")?,
        )
    } else {
        tracing::info!("Chunked uploads disabled");
        None
    };

    // --- Build router ---
    let state = AppState {
        store: store.clone(),
        uploads: uploads.clone(),
        access_key: cfg.server.access_key.as_deref().map(Arc::from),
        max_request_size: cfg.server.max_request_size,
    };
    let app = routes::router(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.server.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.server.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // --- Drain background work ---
    if let Some(uploads) = uploads {
        uploads.shutdown().await;
    }
    store.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
