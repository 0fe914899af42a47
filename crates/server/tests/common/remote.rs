//! In-memory stand-in for a remote object store.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use stash_storage::{ByteStream, ObjectMeta, ObjectStore, StorageError, StorageResult, StreamingUpload};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Remote backend kept in memory. Puts can be made to fail a number of
/// times or to hang, and presigning can be switched off.
#[allow(dead_code)]
#[derive(Default)]
pub struct MemoryStore {
    objects: Arc<DashMap<String, Bytes>>,
    failing_puts: AtomicU32,
    presign_disabled: AtomicBool,
    hanging_puts: AtomicBool,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` uploads with an I/O error.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// While set, uploads never complete.
    pub fn hang_puts(&self, hang: bool) {
        self.hanging_puts.store(hang, Ordering::SeqCst);
    }

    pub fn disable_presign(&self) {
        self.presign_disabled.store(true, Ordering::SeqCst);
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    async fn take_failure(&self) -> StorageResult<()> {
        if self.hanging_puts.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Io(std::io::Error::other("injected put failure")));
        }
        Ok(())
    }
}

struct MemoryUpload {
    key: String,
    buf: BytesMut,
    objects: Arc<DashMap<String, Bytes>>,
}

#[async_trait]
impl StreamingUpload for MemoryUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let size = self.buf.len() as u64;
        self.objects.insert(self.key, self.buf.freeze());
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let data = self
            .object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            last_modified: None,
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let data = self.get(key).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.take_failure().await?;
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.take_failure().await?;
        Ok(Box::new(MemoryUpload {
            key: key.to_string(),
            buf: BytesMut::new(),
            objects: self.objects.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn presign_download_url(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        if self.presign_disabled.load(Ordering::SeqCst) {
            return Err(StorageError::Unsupported {
                backend: self.backend_name(),
                operation: "presigned downloads",
            });
        }
        Ok(format!(
            "https://remote.test/{key}?expires={}",
            ttl.as_secs()
        ))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
