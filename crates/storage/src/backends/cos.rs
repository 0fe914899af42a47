//! Tencent Cloud Object Storage backend.
//!
//! COS speaks the S3 protocol on `cos.{region}.myqcloud.com` with
//! virtual-hosted addressing and SigV4 credentials derived from the
//! account's SecretId/SecretKey, so requests go through the S3 client.

use crate::backends::s3::{S3Backend, S3Options};
use crate::error::StorageResult;
use crate::traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use stash_core::config::CosConfig;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub struct CosBackend {
    inner: S3Backend,
    region: String,
}

impl CosBackend {
    pub fn new(config: &CosConfig) -> StorageResult<Self> {
        let inner = S3Backend::new(S3Options {
            bucket: config.bucket.clone(),
            endpoint: Some(config.endpoint_url()),
            region: Some(config.region.clone()),
            prefix: config.prefix.clone(),
            access_key_id: Some(config.secret_id.clone()),
            secret_access_key: Some(config.secret_key.clone()),
            force_path_style: false,
        })?;
        Ok(Self {
            inner,
            region: config.region.clone(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl ObjectStore for CosBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key).await
    }

    async fn put_file(&self, key: &str, path: &Path) -> StorageResult<u64> {
        self.inner.put_file(key, path).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn presign_download_url(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        self.inner.presign_download_url(key, ttl).await
    }

    fn backend_name(&self) -> &'static str {
        "cos"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner
            .health_check_with_marker(".stash-health-check")
            .await
    }
}
