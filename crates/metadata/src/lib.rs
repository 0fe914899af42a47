//! Metadata store for stash.
//!
//! This crate owns the durable bookkeeping behind the object store:
//! - Physical files keyed by content hash, and their current location
//! - Per-user bindings (logical files) and reference counting
//! - Chunked upload sessions and received parts
//! - The local-to-remote transfer queue

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SqliteStore};

use stash_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
