//! Prometheus metrics for the stash server.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape it.
//! Metrics carry no user ids, names or hashes, only aggregate counts. Keep
//! the endpoint network-restricted to the scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Ingestion
pub static FILES_INGESTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_files_ingested_total",
        "Files whose bytes were stored for the first time",
    )
    .expect("metric creation failed")
});

pub static DEDUP_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_dedup_hits_total",
        "Uploads and rapid checks satisfied by existing content",
    )
    .expect("metric creation failed")
});

pub static INGESTED_BYTES: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("stash_ingested_bytes", "Size of newly stored files").buckets(vec![
            1024.0,
            64.0 * 1024.0,
            1024.0 * 1024.0,
            16.0 * 1024.0 * 1024.0,
            128.0 * 1024.0 * 1024.0,
            1024.0 * 1024.0 * 1024.0,
        ]),
    )
    .expect("metric creation failed")
});

// Chunked uploads
pub static CHUNK_PARTS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_chunk_parts_received_total",
        "Chunk parts accepted, including re-sent parts",
    )
    .expect("metric creation failed")
});

pub static COMPLETION_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stash_chunk_completion_failures_total",
            "Chunked upload completions rejected, by reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static SESSIONS_SWEPT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_chunk_sessions_swept_total",
        "Expired chunk sessions removed by the sweeper",
    )
    .expect("metric creation failed")
});

pub static FILES_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_files_reclaimed_total",
        "Unreferenced files deleted by the sweeper",
    )
    .expect("metric creation failed")
});

// Migration
pub static MIGRATIONS_SUCCEEDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_migrations_succeeded_total",
        "Transfer tasks that moved a file to its remote backend",
    )
    .expect("metric creation failed")
});

pub static MIGRATIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_migrations_failed_total",
        "Transfer task attempts that failed and were scheduled for retry",
    )
    .expect("metric creation failed")
});

pub static MIGRATIONS_DEAD_LETTERED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_migrations_dead_lettered_total",
        "Transfer tasks that exhausted their attempts",
    )
    .expect("metric creation failed")
});

pub static PENDING_TRANSFERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "stash_pending_transfers",
        "Transfer tasks waiting to be migrated",
    )
    .expect("metric creation failed")
});

// Store operations
pub static STORE_OP_TIMEOUTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stash_store_op_timeouts_total",
            "Metadata and storage calls abandoned after the operation timeout",
        ),
        &["operation"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
/// Safe to call multiple times; registration only happens once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(FILES_INGESTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DEDUP_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INGESTED_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_PARTS_RECEIVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COMPLETION_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_SWEPT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FILES_RECLAIMED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MIGRATIONS_SUCCEEDED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MIGRATIONS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MIGRATIONS_DEAD_LETTERED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PENDING_TRANSFERS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(STORE_OP_TIMEOUTS.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record a rejected chunked-upload completion.
pub fn record_completion_failure(reason: &str) {
    COMPLETION_FAILURES.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
        record_completion_failure("missing_chunks");
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("stash_chunk_completion_failures_total"));
    }
}
