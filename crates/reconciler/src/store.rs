//! Store seams: the read-only object cache and the write-side object store.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use crate::types::ObjectKey;
use crate::types::{Bundle, BundleRef, GroupKind, Object};

/// Failure reported by an [`ObjectStore`] call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Read-only view of observed state. Implementations must be cheap to read
/// concurrently from many tasks.
pub trait ObjectCache: Send + Sync {
    fn get(&self, group_kind: &GroupKind, namespace: &str, name: &str) -> Option<Object>;

    fn get_bundle(&self, bundle: &BundleRef) -> Option<Bundle>;

    /// Every object in `namespace` whose controller reference has `uid`.
    fn controlled_by(&self, namespace: &str, uid: &str) -> Vec<Object>;

    /// Every bundle known to the cache.
    fn bundles(&self) -> Vec<BundleRef>;
}

/// Write side of the cluster API.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create(&self, object: Object) -> Result<Object, StoreError>;

    /// Update an object. `metadata.resourceVersion`, when set, must match.
    async fn update(&self, object: Object) -> Result<Object, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Update bundle metadata and spec (finalizers).
    async fn update_bundle(&self, bundle: Bundle) -> Result<Bundle, StoreError>;

    /// Update only the status subresource of a bundle.
    async fn update_bundle_status(&self, bundle: Bundle) -> Result<Bundle, StoreError>;
}

/// Bound a store call by `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out_slow_calls() {
        let limit = Duration::from_millis(50);
        let result: Result<(), StoreError> = bounded(limit, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(StoreError::Timeout(limit)));
    }

    #[tokio::test]
    async fn test_bounded_passes_fast_results_through() {
        let result = bounded(Duration::from_secs(1), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
