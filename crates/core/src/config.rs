//! Configuration types shared across crates.

use crate::file::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Largest request body accepted, in bytes. Bounds single-shot uploads
    /// and individual chunk parts.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Upper bound on a single metadata or remote-store call made while
    /// serving a request (default: 3 seconds).
    #[serde(default = "default_store_op_timeout_secs")]
    pub store_op_timeout_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_upload_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_store_op_timeout_secs() -> u64 {
    3
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_size: default_max_upload_size(),
            metrics_enabled: default_metrics_enabled(),
            store_op_timeout_secs: default_store_op_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn store_op_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.store_op_timeout_secs)
    }
}

/// When newly ingested bytes move to the current durable backend.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    /// Enqueue a transfer task and answer the client immediately.
    #[default]
    Async,
    /// Upload to the remote backend before answering.
    Sync,
}

/// Ingestion pipeline configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Chunk size announced to multipart clients (default: 5 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Idle lifetime of a chunk session. Every accepted part pushes the
    /// expiry forward by this amount.
    #[serde(default = "default_chunk_session_ttl_secs")]
    pub chunk_session_ttl_secs: u64,
    /// Recompute the digest of merged chunks and compare it with the hash the
    /// client declared at init (default: true).
    #[serde(default = "default_verify_content_hash")]
    pub verify_content_hash: bool,
    /// Durable home for new content. `local` disables migration.
    #[serde(default = "default_current_backend")]
    pub current_backend: BackendKind,
    #[serde(default)]
    pub migration_mode: MigrationMode,
    /// Key prefix on remote backends; objects land at `remote_root + hash`.
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    /// Lifetime of presigned download URLs (default: 1 hour).
    #[serde(default = "default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,
    /// Interval between sweeps of abandoned sessions and unreferenced files.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_chunk_session_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_verify_content_hash() -> bool {
    true
}

fn default_current_backend() -> BackendKind {
    BackendKind::Local
}

fn default_remote_root() -> String {
    "files/".to_string()
}

fn default_presign_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_session_ttl_secs: default_chunk_session_ttl_secs(),
            verify_content_hash: default_verify_content_hash(),
            current_backend: default_current_backend(),
            migration_mode: MigrationMode::default(),
            remote_root: default_remote_root(),
            presign_ttl_secs: default_presign_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl IngestConfig {
    pub fn chunk_session_ttl(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.chunk_session_ttl_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    pub fn presign_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.presign_ttl_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(crate::MIN_CHUNK_SIZE..=crate::MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(format!(
                "ingest.chunk_size={} must be between {} and {}",
                self.chunk_size,
                crate::MIN_CHUNK_SIZE,
                crate::MAX_CHUNK_SIZE
            ));
        }
        if self.chunk_session_ttl_secs == 0 {
            return Err("ingest.chunk_session_ttl_secs cannot be 0".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("ingest.sweep_interval_secs cannot be 0. \
                 This would cause a panic when creating the sweep timer."
                .to_string());
        }
        Ok(())
    }
}

/// S3-compatible backend (AWS S3, Ceph RGW, MinIO).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3Config {
    /// Bucket name.
    pub bucket: String,
    /// Optional endpoint URL (for Ceph, MinIO, etc.).
    pub endpoint: Option<String>,
    /// AWS region.
    pub region: Option<String>,
    /// Optional key prefix.
    pub prefix: Option<String>,
    /// Falls back to AWS_ACCESS_KEY_ID env var if not set.
    /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
    pub access_key_id: Option<String>,
    /// Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
    pub secret_access_key: Option<String>,
    /// Force path-style URLs (`endpoint/bucket/key` instead of `bucket.endpoint/key`).
    /// Required for Ceph and MinIO.
    #[serde(default)]
    pub force_path_style: bool,
}

impl S3Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket.is_empty() {
            return Err("storage.s3.bucket cannot be empty".to_string());
        }
        match (self.access_key_id.as_ref(), self.secret_access_key.as_ref()) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            _ => Err(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ),
        }
    }
}

/// Tencent Cloud Object Storage backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CosConfig {
    /// Bucket name including the app id suffix (e.g. `media-1250000000`).
    pub bucket: String,
    /// COS region (e.g. `ap-guangzhou`).
    pub region: String,
    pub secret_id: String,
    pub secret_key: String,
    /// Optional key prefix.
    pub prefix: Option<String>,
    /// Override the `https://cos.{region}.myqcloud.com` endpoint.
    pub endpoint: Option<String>,
}

impl CosConfig {
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://cos.{}.myqcloud.com", self.region))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bucket.is_empty() || self.region.is_empty() {
            return Err("storage.cos requires bucket and region".to_string());
        }
        if self.secret_id.is_empty() || self.secret_key.is_empty() {
            return Err("storage.cos requires secret_id and secret_key".to_string());
        }
        Ok(())
    }
}

/// Storage backends. The local root is always present: it stages uploads,
/// chunk directories, and merged content awaiting migration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    #[serde(default)]
    pub s3: Option<S3Config>,
    #[serde(default)]
    pub cos: Option<CosConfig>,
}

fn default_local_root() -> PathBuf {
    PathBuf::from("./data/storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_root: default_local_root(),
            s3: None,
            cos: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(s3) = &self.s3 {
            s3.validate()?;
        }
        if let Some(cos) = &self.cos {
            cos.validate()?;
        }
        Ok(())
    }

    /// Whether a backend of this kind is configured.
    pub fn has_backend(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Local => true,
            BackendKind::S3 => self.s3.is_some(),
            BackendKind::Cos => self.cos.is_some(),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// How long a statement waits on a locked database, in seconds.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Transfer queue consumer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Run the migration worker in this process (default: true).
    #[serde(default = "default_migration_enabled")]
    pub enabled: bool,
    /// Sleep between polls when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Attempts before a task is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// How long a claimed task stays invisible to other consumers. A worker
    /// that dies mid-task releases it when the lease lapses.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Upper bound on one remote upload. Must stay below `lease_secs` so a
    /// stuck put is abandoned before its task is handed to another worker.
    #[serde(default = "default_put_timeout_secs")]
    pub put_timeout_secs: u64,
}

fn default_migration_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_backoff_secs() -> u64 {
    5
}

fn default_max_backoff_secs() -> u64 {
    900 // 15 minutes
}

fn default_lease_secs() -> u64 {
    600
}

fn default_put_timeout_secs() -> u64 {
    300
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: default_migration_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            lease_secs: default_lease_secs(),
            put_timeout_secs: default_put_timeout_secs(),
        }
    }
}

impl MigrationConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn put_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.put_timeout_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::seconds(i64::try_from(self.lease_secs).unwrap_or(i64::MAX))
    }

    /// Delay before the next attempt after `attempts` failures:
    /// `base * 2^(attempts - 1)`, capped at `max_backoff_secs`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32);
        let secs = self
            .base_backoff_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_secs);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("migration.max_attempts must be at least 1".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("migration.poll_interval_ms cannot be 0".to_string());
        }
        if self.lease_secs == 0 {
            return Err("migration.lease_secs cannot be 0".to_string());
        }
        if self.put_timeout_secs == 0 || self.put_timeout_secs >= self.lease_secs {
            return Err(format!(
                "migration.put_timeout_secs ({}) must be between 1 and lease_secs ({})",
                self.put_timeout_secs, self.lease_secs
            ));
        }
        if self.base_backoff_secs > self.max_backoff_secs {
            return Err(format!(
                "migration.base_backoff_secs ({}) exceeds max_backoff_secs ({})",
                self.base_backoff_secs, self.max_backoff_secs
            ));
        }
        Ok(())
    }
}

/// Identity propagation from the fronting auth layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the authenticated numeric user id.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Local storage, SQLite metadata, small chunks.
    pub fn for_testing() -> Self {
        Self {
            ingest: IngestConfig {
                chunk_size: crate::MIN_CHUNK_SIZE,
                ..IngestConfig::default()
            },
            migration: MigrationConfig {
                poll_interval_ms: 20,
                base_backoff_secs: 0,
                max_backoff_secs: 0,
                ..MigrationConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate cross-section invariants.
    pub fn validate(&self) -> Result<(), String> {
        self.ingest.validate()?;
        self.storage.validate()?;
        self.migration.validate()?;
        if !self.storage.has_backend(self.ingest.current_backend) {
            return Err(format!(
                "ingest.current_backend={} but storage.{} is not configured",
                self.ingest.current_backend, self.ingest.current_backend
            ));
        }
        if self.auth.user_header.trim().is_empty() {
            return Err("auth.user_header cannot be empty".to_string());
        }
        Ok(())
    }
}
