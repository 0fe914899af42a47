//! Route configuration.

use crate::auth::trace_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries and the small text fields.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

fn body_limit(payload: u64) -> usize {
    usize::try_from(payload.saturating_add(MULTIPART_OVERHEAD)).unwrap_or(usize::MAX)
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let upload_limit = body_limit(state.config.server.max_upload_size);
    let chunk_limit = body_limit(state.config.ingest.chunk_size);

    let upload_routes = Router::new()
        .route("/v1/upload", post(handlers::upload_file))
        .layer(DefaultBodyLimit::max(upload_limit));

    let chunk_routes = Router::new()
        .route("/v1/chunk/part", post(handlers::upload_chunk_part))
        .layer(DefaultBodyLimit::max(chunk_limit));

    let api_routes = Router::new()
        // Health check (unauthenticated, for probes)
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/chunk/init", post(handlers::init_chunk_upload))
        .route("/v1/chunk/complete", post(handlers::complete_chunk_upload))
        .route("/v1/rapidcheck", post(handlers::rapid_check))
        .route("/v1/files", get(handlers::list_files))
        .route(
            "/v1/files/{file_id}",
            get(handlers::get_file)
                .put(handlers::rename_file)
                .delete(handlers::delete_file),
        )
        .route("/v1/files/{file_id}/url", get(handlers::file_url))
        .route("/v1/files/{file_id}/download", get(handlers::download_file));

    let mut router = Router::new()
        .merge(upload_routes)
        .merge(chunk_routes)
        .merge(api_routes);

    // When enabled, this endpoint must be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    // Layers run outermost first: TraceLayer -> trace id -> handler.
    router
        .layer(middleware::from_fn(trace_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
