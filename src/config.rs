use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub uploads: ChunkedUploadConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `None` disables access checks.
    pub access_key: Option<String>,
    /// Largest body accepted by the direct upload route.
    pub max_request_size: u64,
}

/// Settings for the object store, cache and background maintenance.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub storage_dir: PathBuf,
    /// Memory budget for cached payloads.
    pub max_ram: u64,
    /// Disk budget; 0 means unlimited.
    pub max_storage: u64,
    pub enable_expiration: bool,
    /// Applied when the caller gives no TTL; 0 means never expire.
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
    /// Expired-object sweep period; 0 disables the task.
    pub cleanup_interval_secs: u64,
    pub cache_max_entries: usize,
    /// Cache eviction sweep period; 0 disables the task.
    pub cache_sweep_interval_secs: u64,
    pub compression: CompressionConfig,
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// gzip level, clamped to 1..=9.
    pub level: u32,
    /// Payloads shorter than this are stored raw.
    pub threshold: u64,
}

#[derive(Debug, Clone)]
pub struct ChunkedUploadConfig {
    pub enabled: bool,
    pub temp_dir: PathBuf,
    pub chunk_size: u64,
    pub max_file_size: u64,
    /// How long a session may stay open before it is discarded.
    pub session_timeout_secs: u64,
    /// Session expiry sweep period; 0 disables the task.
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            access_key: None,
            max_request_size: 100 * MIB,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data/storage"),
            max_ram: GIB,
            max_storage: 10 * GIB,
            enable_expiration: true,
            default_ttl_secs: 86_400,
            max_ttl_secs: 604_800,
            cleanup_interval_secs: 3_600,
            cache_max_entries: 100,
            cache_sweep_interval_secs: 300,
            compression: CompressionConfig::default(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 6,
            threshold: 1024,
        }
    }
}

impl Default for ChunkedUploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            temp_dir: PathBuf::from("./data/temp/uploads"),
            chunk_size: 12 * MIB,
            max_file_size: 5 * GIB,
            session_timeout_secs: 3_600,
            sweep_interval_secs: 1_800,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Blob storage service with resumable chunked uploads")]
pub struct Args {
    /// Host to bind to (overrides BLOB_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BLOB_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads and the index live (overrides BLOB_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Scratch directory for chunked uploads (overrides BLOB_STORE_TEMP_DIR)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Shared access key for protected routes (overrides BLOB_STORE_ACCESS_KEY)
    #[arg(long)]
    pub access_key: Option<String>,

    /// Cache memory budget in bytes (overrides BLOB_STORE_MAX_RAM)
    #[arg(long)]
    pub max_ram: Option<u64>,

    /// Disk budget in bytes, 0 for unlimited (overrides BLOB_STORE_MAX_STORAGE)
    #[arg(long)]
    pub max_storage: Option<u64>,

    /// Disable the chunked upload routes
    #[arg(long)]
    pub no_chunked_uploads: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        // Parse CLI once
        let args = Args::parse();
        let mut cfg = Self::from_env()?;

        // --- Merge ---
        if let Some(host) = args.host {
            cfg.server.host = host;
        }
        if let Some(port) = args.port {
            cfg.server.port = port;
        }
        if let Some(key) = args.access_key {
            cfg.server.access_key = Some(key);
        }
        if let Some(dir) = args.storage_dir {
            cfg.storage.storage_dir = dir;
        }
        if let Some(dir) = args.temp_dir {
            cfg.uploads.temp_dir = dir;
        }
        if let Some(max_ram) = args.max_ram {
            cfg.storage.max_ram = max_ram;
        }
        if let Some(max_storage) = args.max_storage {
            cfg.storage.max_storage = max_storage;
        }
        if args.no_chunked_uploads {
            cfg.uploads.enabled = false;
        }

        Ok(cfg)
    }

    /// Environment fallback over built-in defaults.
    pub fn from_env() -> Result<Self> {
        let server_defaults = ServerConfig::default();
        let storage_defaults = StorageConfig::default();
        let compression_defaults = CompressionConfig::default();
        let upload_defaults = ChunkedUploadConfig::default();

        let server = ServerConfig {
            host: env::var("BLOB_STORE_HOST").unwrap_or(server_defaults.host),
            port: env_or("BLOB_STORE_PORT", server_defaults.port)?,
            access_key: env::var("BLOB_STORE_ACCESS_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            max_request_size: env_or(
                "BLOB_STORE_MAX_REQUEST_SIZE",
                server_defaults.max_request_size,
            )?,
        };

        let storage = StorageConfig {
            storage_dir: env_or("BLOB_STORE_STORAGE_DIR", storage_defaults.storage_dir)?,
            max_ram: env_or("BLOB_STORE_MAX_RAM", storage_defaults.max_ram)?,
            max_storage: env_or("BLOB_STORE_MAX_STORAGE", storage_defaults.max_storage)?,
            enable_expiration: env_or(
                "BLOB_STORE_ENABLE_EXPIRATION",
                storage_defaults.enable_expiration,
            )?,
            default_ttl_secs: env_or("BLOB_STORE_DEFAULT_TTL", storage_defaults.default_ttl_secs)?,
            max_ttl_secs: env_or("BLOB_STORE_MAX_TTL", storage_defaults.max_ttl_secs)?,
            cleanup_interval_secs: env_or(
                "BLOB_STORE_CLEANUP_INTERVAL",
                storage_defaults.cleanup_interval_secs,
            )?,
            cache_max_entries: env_or(
                "BLOB_STORE_CACHE_MAX_ENTRIES",
                storage_defaults.cache_max_entries,
            )?,
            cache_sweep_interval_secs: env_or(
                "BLOB_STORE_CACHE_SWEEP_INTERVAL",
                storage_defaults.cache_sweep_interval_secs,
            )?,
            compression: CompressionConfig {
                enabled: env_or("BLOB_STORE_COMPRESSION", compression_defaults.enabled)?,
                level: env_or("BLOB_STORE_COMPRESSION_LEVEL", compression_defaults.level)?
                    .clamp(1, 9),
                threshold: env_or(
                    "BLOB_STORE_COMPRESSION_THRESHOLD",
                    compression_defaults.threshold,
                )?,
            },
        };

        let uploads = ChunkedUploadConfig {
            enabled: env_or("BLOB_STORE_CHUNKED_ENABLED", upload_defaults.enabled)?,
            temp_dir: env_or("BLOB_STORE_TEMP_DIR", upload_defaults.temp_dir)?,
            chunk_size: env_or("BLOB_STORE_CHUNK_SIZE", upload_defaults.chunk_size)?,
            max_file_size: env_or("BLOB_STORE_MAX_FILE_SIZE", upload_defaults.max_file_size)?,
            session_timeout_secs: env_or(
                "BLOB_STORE_SESSION_TIMEOUT",
                upload_defaults.session_timeout_secs,
            )?,
            sweep_interval_secs: env_or(
                "BLOB_STORE_SESSION_SWEEP_INTERVAL",
                upload_defaults.sweep_interval_secs,
            )?,
        };

        if uploads.chunk_size == 0 {
            anyhow::bail!("BLOB_STORE_CHUNK_SIZE must be greater than zero");
        }

        Ok(Self {
            server,
            storage,
            uploads,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Read and parse `key`, falling back to `default` when it is unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
