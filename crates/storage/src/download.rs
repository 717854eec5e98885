//! Object downloads.
//!
//! Downloads are single requests through the client; they share the
//! orchestrator's worker pool and retry policy with uploads.

use std::path::Path;

use tokio::sync::Semaphore;

use crate::error::StorageError;
use crate::orchestrator::{acquire, TransferOrchestrator};
use crate::retry::with_retry;
use crate::traits::{ObjectInfo, StorageClient};

impl<C: StorageClient + ?Sized + 'static> TransferOrchestrator<C> {
    /// Download an object to a local file, creating parent directories.
    ///
    /// # Arguments
    /// * `bucket` - Source bucket
    /// * `key` - Source key
    /// * `destination` - Local file to create or overwrite
    ///
    /// # Returns
    /// Number of bytes written.
    pub async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<u64, StorageError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::IoError {
                    path: parent.display().to_string(),
                    message: e.to_string(),
                })?;
        }

        let client: &C = &self.shared.client;
        let pool: &Semaphore = &self.shared.pool;
        let retry = &self.shared.settings.retry;
        let bytes: u64 = with_retry(retry, "get_object_to_file", move || async move {
            let _permit = acquire(pool).await?;
            client.get_object_to_file(bucket, key, destination).await
        })
        .await?;

        tracing::debug!(
            bucket,
            key,
            bytes,
            path = %destination.display(),
            "Object downloaded"
        );
        Ok(bytes)
    }

    /// Download an object into memory.
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let client: &C = &self.shared.client;
        let pool: &Semaphore = &self.shared.pool;
        with_retry(&self.shared.settings.retry, "get_object", move || async move {
            let _permit = acquire(pool).await?;
            client.get_object(bucket, key).await
        })
        .await
    }

    /// Object metadata, or `None` if the object does not exist.
    pub async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, StorageError> {
        let client: &C = &self.shared.client;
        with_retry(&self.shared.settings.retry, "head_object", move || async move {
            client.head_object(bucket, key).await
        })
        .await
    }
}
