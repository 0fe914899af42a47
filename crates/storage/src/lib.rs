//! Object storage abstraction and backends for stash.
//!
//! This crate provides:
//! - The [`ObjectStore`] trait: put/get/delete/exists/presign over a durable medium
//! - Backends: local filesystem, S3-compatible (AWS, Ceph RGW, MinIO), Tencent COS
//! - [`ContentDigester`]: hash-while-persist for incoming uploads
//! - [`BackendSet`]: the configured backends, addressed by [`BackendKind`]

pub mod backends;
pub mod digester;
pub mod error;
pub mod traits;

pub use backends::{cos::CosBackend, filesystem::FilesystemBackend, s3::S3Backend};
pub use digester::{ContentDigester, DigestWriter, DigestedContent};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};

use stash_core::BackendKind;
use stash_core::config::StorageConfig;
use std::sync::Arc;

/// The configured backends.
///
/// The local backend always exists; it stages uploads and holds content
/// until migration. Remote backends are optional.
#[derive(Clone)]
pub struct BackendSet {
    local: Arc<FilesystemBackend>,
    s3: Option<Arc<dyn ObjectStore>>,
    cos: Option<Arc<dyn ObjectStore>>,
}

impl BackendSet {
    pub fn new(local: Arc<FilesystemBackend>) -> Self {
        Self {
            local,
            s3: None,
            cos: None,
        }
    }

    /// Install (or replace) a remote backend.
    pub fn with_remote(mut self, kind: BackendKind, store: Arc<dyn ObjectStore>) -> Self {
        match kind {
            BackendKind::Local => {
                tracing::warn!("ignoring remote store registered as local backend");
            }
            BackendKind::S3 => self.s3 = Some(store),
            BackendKind::Cos => self.cos = Some(store),
        }
        self
    }

    pub fn local(&self) -> &Arc<FilesystemBackend> {
        &self.local
    }

    /// Backend for a file's storage tag.
    pub fn get(&self, kind: BackendKind) -> StorageResult<Arc<dyn ObjectStore>> {
        let store = match kind {
            BackendKind::Local => Some(self.local.clone() as Arc<dyn ObjectStore>),
            BackendKind::S3 => self.s3.clone(),
            BackendKind::Cos => self.cos.clone(),
        };
        store.ok_or_else(|| StorageError::Config(format!("storage backend {kind} is not configured")))
    }

    /// Run every configured backend's health check.
    pub async fn health_check(&self) -> StorageResult<()> {
        self.local.health_check().await?;
        if let Some(s3) = &self.s3 {
            s3.health_check().await?;
        }
        if let Some(cos) = &self.cos {
            cos.health_check().await?;
        }
        Ok(())
    }
}

/// Create the backend set from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<BackendSet> {
    config.validate().map_err(StorageError::Config)?;

    let mut set = BackendSet::new(Arc::new(FilesystemBackend::new(&config.local_root).await?));
    if let Some(s3) = &config.s3 {
        set = set.with_remote(BackendKind::S3, Arc::new(S3Backend::from_config(s3)?));
    }
    if let Some(cos) = &config.cos {
        set = set.with_remote(BackendKind::Cos, Arc::new(CosBackend::new(cos)?));
    }
    Ok(set)
}
