//! Liveness and dependency health.

use crate::envelope::{self, Envelope};
use crate::error::ApiResult;
use crate::state::AppState;
use crate::timeouts::bounded;
use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub current_backend: String,
}

/// GET /v1/health - Health check.
///
/// Unauthenticated so probes and load balancers can call it. Fails with
/// `metadata_unavailable` or `storage_unavailable` when a dependency is down.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<Envelope<HealthResponse>>> {
    let timeout = state.config.server.store_op_timeout();
    bounded(timeout, "metadata", state.metadata.health_check()).await?;
    bounded(timeout, "storage", state.backends.health_check()).await?;

    Ok(envelope::ok(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        current_backend: state.config.ingest.current_backend.to_string(),
    }))
}
