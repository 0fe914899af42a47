//! Bounded store operations.

use crate::error::{ApiError, ApiResult};
use crate::metrics::STORE_OP_TIMEOUTS;
use std::future::Future;
use std::time::Duration;

/// Run a metadata or storage call, failing with [`ApiError::Timeout`] if it
/// does not finish within `limit`. The abandoned future is dropped.
pub async fn bounded<T, E, F>(limit: Duration, operation: &'static str, fut: F) -> ApiResult<T>
where
    F: Future<Output = Result<T, E>>,
    ApiError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => {
            STORE_OP_TIMEOUTS.with_label_values(&[operation]).inc();
            tracing::warn!(
                operation,
                timeout_ms = limit.as_millis() as u64,
                error_class = "transient_storage",
                "Store operation timed out"
            );
            Err(ApiError::Timeout { operation })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_metadata::MetadataError;

    #[tokio::test]
    async fn test_passes_through_result() {
        let value = bounded(Duration::from_secs(1), "metadata", async {
            Ok::<_, MetadataError>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);

        let err = bounded(Duration::from_secs(1), "metadata", async {
            Err::<(), _>(MetadataError::NotFound("x".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Metadata(MetadataError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_elapsed_becomes_timeout() {
        let err = bounded(Duration::from_millis(20), "storage", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), MetadataError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Timeout { operation: "storage" }));
    }
}
