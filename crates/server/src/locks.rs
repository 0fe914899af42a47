//! Per-content-hash async locks.
//!
//! Commit, reclaim and migration finalize for the same content hash run one
//! at a time within this process. Entries are dropped once nobody holds or
//! waits on them, so the map only grows with concurrent work.

use dashmap::DashMap;
use stash_core::ContentHash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct HashLocks {
    inner: Arc<DashMap<ContentHash, Arc<Mutex<()>>>>,
}

impl HashLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `hash`.
    pub async fn lock(&self, hash: ContentHash) -> HashGuard {
        let mutex = self
            .inner
            .entry(hash)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        HashGuard {
            hash,
            guard: Some(guard),
            locks: self.inner.clone(),
        }
    }

    /// Number of hashes currently locked or waited on.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Held lock on one content hash. Released on drop.
pub struct HashGuard {
    hash: ContentHash,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<ContentHash, Arc<Mutex<()>>>>,
}

impl Drop for HashGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: no holder, no waiter.
        self.locks
            .remove_if(&self.hash, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
