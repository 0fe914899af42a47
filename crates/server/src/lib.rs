//! HTTP ingestion server for stash.
//!
//! This crate provides the request-facing half of the service:
//! - Single-shot and chunked (resumable) uploads with content dedup
//! - Rapid upload: binding to existing content by hash
//! - File listing, rename, delete and download
//! - The migration worker that moves staged bytes to the durable backend
//! - The sweeper that reclaims abandoned sessions and unreferenced files

pub mod auth;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod locks;
pub mod metrics;
pub mod migration;
pub mod routes;
pub mod state;
pub mod sweeper;
pub mod timeouts;

pub use auth::{AuthenticatedUser, TraceId};
pub use error::{ApiError, ApiResult, ErrorClass};
pub use routes::create_router;
pub use state::AppState;
