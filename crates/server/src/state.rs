//! Application state shared across handlers.

use crate::ingest::{ChunkUploadCoordinator, IngestService};
use crate::locks::HashLocks;
use crate::migration::{MigrationWorker, Migrator};
use crate::sweeper::Sweeper;
use stash_core::config::AppConfig;
use stash_metadata::MetadataStore;
use stash_storage::BackendSet;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Local staging backend plus the configured remote backends.
    pub backends: BackendSet,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Per-content-hash locks shared by ingestion, migration and the sweeper.
    pub locks: HashLocks,
    pub migrator: Arc<Migrator>,
    pub ingest: Arc<IngestService>,
    pub chunks: Arc<ChunkUploadCoordinator>,
}

impl AppState {
    /// Wire up the services. Fails if the configuration does not validate.
    pub fn new(
        config: AppConfig,
        backends: BackendSet,
        metadata: Arc<dyn MetadataStore>,
    ) -> Result<Self, String> {
        config.validate()?;
        // The current backend must be reachable, not just configured.
        backends
            .get(config.ingest.current_backend)
            .map_err(|e| e.to_string())?;

        let config = Arc::new(config);
        let locks = HashLocks::new();
        let migrator = Arc::new(Migrator::new(
            metadata.clone(),
            backends.clone(),
            locks.clone(),
            config.server.store_op_timeout(),
            config.migration.put_timeout(),
        ));
        let ingest = Arc::new(IngestService::new(
            config.clone(),
            metadata.clone(),
            backends.clone(),
            locks.clone(),
            migrator.clone(),
        ));
        let chunks = Arc::new(ChunkUploadCoordinator::new(
            config.clone(),
            metadata.clone(),
            ingest.clone(),
            backends.local().clone(),
        ));

        Ok(Self {
            config,
            backends,
            metadata,
            locks,
            migrator,
            ingest,
            chunks,
        })
    }

    /// Queue consumer sharing this state's migrator.
    pub fn migration_worker(&self) -> MigrationWorker {
        MigrationWorker::new(
            self.metadata.clone(),
            self.migrator.clone(),
            self.config.migration.clone(),
            self.config.server.store_op_timeout(),
        )
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.metadata.clone(),
            self.backends.clone(),
            self.locks.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_core::BackendKind;
    use stash_metadata::SqliteStore;
    use stash_storage::FilesystemBackend;
    use tempfile::tempdir;

    async fn parts() -> (tempfile::TempDir, BackendSet, Arc<dyn MetadataStore>) {
        let temp = tempdir().unwrap();
        let local = Arc::new(FilesystemBackend::new(temp.path().join("storage")).await.unwrap());
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp.path().join("metadata.db"), None)
                .await
                .unwrap(),
        );
        (temp, BackendSet::new(local), metadata)
    }

    #[tokio::test]
    async fn test_new_accepts_testing_config() {
        let (_temp, backends, metadata) = parts().await;
        assert!(AppState::new(AppConfig::for_testing(), backends, metadata).is_ok());
    }

    #[tokio::test]
    async fn test_new_rejects_unconfigured_current_backend() {
        let (_temp, backends, metadata) = parts().await;
        let mut config = AppConfig::for_testing();
        config.ingest.current_backend = BackendKind::S3;
        assert!(AppState::new(config, backends, metadata).is_err());
    }
}
