//! Bulk listing and deletion of keys.
//!
//! Listing is a lazy stream over the store's continuation-token pages.
//! Deletes are issued in batches of at most `batch_limit` keys; a batch
//! that partly fails is recorded per key and does not stop later batches.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use stowage_common::{DELETE_BATCH_LIMIT, KEY_SEPARATOR};

use crate::error::{KeyFailure, StorageError};
use crate::retry::with_retry;
use crate::traits::{DeleteOutput, ListPage, StorageClient};
use crate::types::{JobState, ObjectKey, PurgeSettings, Visibility};

/// Aggregated outcome of one or more bulk delete requests.
#[derive(Debug, Clone, Default)]
pub struct DeleteReport {
    /// Keys confirmed deleted.
    pub deleted: Vec<String>,
    /// Keys that could not be deleted, with the reason.
    pub failed: Vec<KeyFailure>,
    /// Number of bulk delete requests issued.
    pub batches: usize,
    /// Set when listing stopped before every key was seen. Batches issued
    /// before the failure are still reported.
    pub listing_error: Option<StorageError>,
}

impl DeleteReport {
    /// Whether every key was listed and deleted.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.listing_error.is_none()
    }

    /// Number of keys deleted.
    pub fn deleted_count(&self) -> u64 {
        self.deleted.len() as u64
    }

    fn merge(&mut self, other: DeleteReport) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
        self.batches += other.batches;
        if self.listing_error.is_none() {
            self.listing_error = other.listing_error;
        }
    }
}

/// Result of [`BucketReconciler::purge_and_delete_bucket`].
#[derive(Debug, Clone)]
pub struct BucketPurgeJob {
    pub bucket: String,
    /// Keys deleted across all passes.
    pub deleted_count: u64,
    /// Keys that could not be deleted.
    pub failed: Vec<KeyFailure>,
    /// `Succeeded` only if the bucket itself was deleted.
    pub state: JobState,
    pub last_error: Option<StorageError>,
}

impl BucketPurgeJob {
    fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            deleted_count: 0,
            failed: Vec::new(),
            state: JobState::InProgress,
            last_error: None,
        }
    }

    fn record(&mut self, report: DeleteReport) {
        self.deleted_count += report.deleted_count();
        self.failed.extend(report.failed);
    }

    fn fail(mut self, error: StorageError) -> Self {
        tracing::error!(bucket = %self.bucket, error = %error, "Bucket purge failed");
        self.state = JobState::Failed;
        self.last_error = Some(error);
        self
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Enumerates and bulk-deletes keys using any StorageClient implementation.
pub struct BucketReconciler<C: StorageClient + ?Sized + 'static> {
    client: Arc<C>,
    settings: PurgeSettings,
}

impl<C: StorageClient + ?Sized + 'static> BucketReconciler<C> {
    /// Create a new reconciler.
    ///
    /// # Errors
    /// Returns `Validation` if `batch_limit` is zero or above the store's
    /// per-request maximum, or if `page_size` is not positive.
    pub fn new(client: Arc<C>, settings: PurgeSettings) -> Result<Self, StorageError> {
        if settings.batch_limit == 0 || settings.batch_limit > DELETE_BATCH_LIMIT {
            return Err(StorageError::validation(format!(
                "batch_limit must be between 1 and {}",
                DELETE_BATCH_LIMIT
            )));
        }
        if settings.page_size <= 0 {
            return Err(StorageError::validation("page_size must be positive"));
        }
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &PurgeSettings {
        &self.settings
    }

    /// Lazily list every key in `bucket`, optionally under `prefix`.
    ///
    /// Pages are fetched on demand. Each call starts a fresh listing.
    pub fn list_all(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> impl Stream<Item = Result<ObjectKey, StorageError>> + Send + 'static {
        let client: Arc<C> = Arc::clone(&self.client);
        let bucket: String = bucket.to_string();
        let prefix: Option<String> = prefix.map(str::to_string);
        let page_size: i32 = self.settings.page_size;
        let retry = self.settings.retry.clone();

        stream::try_unfold(
            (Cursor::Start, VecDeque::<ObjectKey>::new()),
            move |(cursor, mut buffered)| {
                let client = Arc::clone(&client);
                let bucket = bucket.clone();
                let prefix = prefix.clone();
                let retry = retry.clone();
                async move {
                    let mut cursor = cursor;
                    loop {
                        if let Some(key) = buffered.pop_front() {
                            return Ok::<_, StorageError>(Some((key, (cursor, buffered))));
                        }
                        let token: Option<String> = match cursor {
                            Cursor::Done => return Ok(None),
                            Cursor::Start => None,
                            Cursor::Next(token) => Some(token),
                        };

                        let client: &C = &client;
                        let (bucket_ref, prefix_ref) = (bucket.as_str(), prefix.as_deref());
                        let token_ref: Option<&str> = token.as_deref();
                        let page: ListPage = with_retry(&retry, "list_objects", move || async move {
                            client
                                .list_objects(bucket_ref, prefix_ref, token_ref, page_size)
                                .await
                        })
                        .await?;

                        tracing::trace!(
                            bucket = %bucket,
                            keys = page.objects.len(),
                            more = page.next_continuation_token.is_some(),
                            "Listed page"
                        );
                        buffered.extend(
                            page.objects
                                .into_iter()
                                .map(|object| ObjectKey::new(bucket.as_str(), object.key)),
                        );
                        cursor = match page.next_continuation_token {
                            Some(next) => Cursor::Next(next),
                            None => Cursor::Done,
                        };
                    }
                }
            },
        )
    }

    /// Delete every key in `bucket` (optionally under `prefix`).
    ///
    /// Keys are deleted in batches as the listing streams in. Per-key
    /// failures are collected in the report. A listing failure stops the
    /// purge: keys listed so far are still deleted and the error is kept in
    /// [`DeleteReport::listing_error`].
    pub async fn purge(&self, bucket: &str, prefix: Option<&str>) -> DeleteReport {
        let mut keys = Box::pin(self.list_all(bucket, prefix));
        let mut report = DeleteReport::default();
        let mut batch: Vec<String> = Vec::with_capacity(self.settings.batch_limit);

        while let Some(item) = keys.next().await {
            match item {
                Ok(object) => batch.push(object.key),
                Err(err) => {
                    tracing::warn!(bucket, error = %err, "Listing failed during purge");
                    report.listing_error = Some(err);
                    break;
                }
            }
            if batch.len() == self.settings.batch_limit {
                let full: Vec<String> = std::mem::take(&mut batch);
                report.merge(self.delete_batch(bucket, full).await);
            }
        }
        if !batch.is_empty() {
            report.merge(self.delete_batch(bucket, batch).await);
        }

        tracing::info!(
            bucket,
            prefix = prefix.unwrap_or(""),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            batches = report.batches,
            complete = report.is_complete(),
            "Purge finished"
        );
        report
    }

    /// Delete every key in `bucket`, confirm it is empty, then delete it.
    ///
    /// After the purge the bucket is listed once more; keys that show up
    /// late get one more delete pass, after which the bucket must list
    /// empty. The bucket is only deleted when no key has a failed delete.
    /// Keys deleted before a failure are still counted in the job.
    pub async fn purge_and_delete_bucket(&self, bucket: &str) -> BucketPurgeJob {
        let mut job = BucketPurgeJob::new(bucket);

        let mut report: DeleteReport = self.purge(bucket, None).await;
        let listing_error: Option<StorageError> = report.listing_error.take();
        job.record(report);
        if let Some(err) = listing_error {
            return job.fail(err);
        }
        if let Some(first) = job.failed.first() {
            let error: StorageError = first.error.clone();
            return job.fail(error);
        }

        let remaining: Vec<String> = match self.list_keys(bucket).await {
            Ok(keys) => keys,
            Err(err) => return job.fail(err),
        };
        if !remaining.is_empty() {
            tracing::warn!(
                bucket,
                remaining = remaining.len(),
                "Keys still listed after purge, deleting again"
            );
            job.record(self.delete_objects(bucket, &remaining).await);
            if let Some(first) = job.failed.first() {
                let error: StorageError = first.error.clone();
                return job.fail(error);
            }

            match self.list_keys(bucket).await {
                Ok(keys) if keys.is_empty() => {}
                Ok(keys) => {
                    return job.fail(StorageError::Service {
                        code: "BucketNotEmpty".to_string(),
                        message: format!(
                            "{} keys still listed after a second delete pass",
                            keys.len()
                        ),
                    });
                }
                Err(err) => return job.fail(err),
            }
        }

        let client: &C = &self.client;
        let result = with_retry(&self.settings.retry, "delete_bucket", move || async move {
            client.delete_bucket(bucket).await
        })
        .await;
        match result {
            Ok(()) => {
                tracing::info!(bucket, deleted = job.deleted_count, "Bucket deleted");
                job.state = JobState::Succeeded;
                job
            }
            Err(err) => job.fail(err),
        }
    }

    /// Delete one object.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        validate_target(bucket, key)?;
        let client: &C = &self.client;
        with_retry(&self.settings.retry, "delete_object", move || async move {
            client.delete_object(bucket, key).await
        })
        .await
    }

    /// Delete `keys`, split into batches of at most `batch_limit`.
    pub async fn delete_objects(&self, bucket: &str, keys: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for chunk in keys.chunks(self.settings.batch_limit) {
            report.merge(self.delete_batch(bucket, chunk.to_vec()).await);
        }
        report
    }

    /// Delete every key under the virtual directory `prefix`.
    ///
    /// The prefix is treated as a directory: `photos` deletes `photos/` and
    /// everything below it, but not `photos-old/`.
    ///
    /// # Errors
    /// Returns `Validation` for an empty prefix, which would match the whole bucket.
    pub async fn delete_key_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<DeleteReport, StorageError> {
        let trimmed: &str = prefix.trim_matches(KEY_SEPARATOR);
        if trimmed.is_empty() {
            return Err(StorageError::validation(
                "key prefix is empty; use purge to empty a bucket",
            ));
        }
        let directory: String = format!("{}{}", trimmed, KEY_SEPARATOR);
        Ok(self.purge(bucket, Some(&directory)).await)
    }

    /// Create a bucket.
    pub async fn create_bucket(
        &self,
        bucket: &str,
        visibility: Visibility,
    ) -> Result<(), StorageError> {
        if bucket.trim().is_empty() {
            return Err(StorageError::validation("bucket name is empty"));
        }
        let client: &C = &self.client;
        with_retry(&self.settings.retry, "create_bucket", move || async move {
            client.create_bucket(bucket, visibility).await
        })
        .await
    }

    /// Whether a bucket exists.
    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let client: &C = &self.client;
        with_retry(&self.settings.retry, "bucket_exists", move || async move {
            client.bucket_exists(bucket).await
        })
        .await
    }

    /// Names of every bucket visible to the client.
    pub async fn list_buckets(&self) -> Result<Vec<String>, StorageError> {
        let client: &C = &self.client;
        with_retry(&self.settings.retry, "list_buckets", move || async move {
            client.list_buckets().await
        })
        .await
    }

    /// Time-limited URL for an object, produced by the client.
    pub async fn object_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        validate_target(bucket, key)?;
        self.client.presign_url(bucket, key, expires_in).await
    }

    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Box::pin(self.list_all(bucket, None));
        let mut listed: Vec<String> = Vec::new();
        while let Some(item) = keys.next().await {
            listed.push(item?.key);
        }
        Ok(listed)
    }

    async fn delete_batch(&self, bucket: &str, keys: Vec<String>) -> DeleteReport {
        let client: &C = &self.client;
        let keys_ref: &[String] = &keys;
        let result: Result<DeleteOutput, StorageError> =
            with_retry(&self.settings.retry, "delete_objects", move || async move {
                client.delete_objects(bucket, keys_ref).await
            })
            .await;

        match result {
            Ok(output) => {
                if !output.failed.is_empty() {
                    tracing::warn!(
                        bucket,
                        deleted = output.deleted.len(),
                        failed = output.failed.len(),
                        "Bulk delete partially failed"
                    );
                }
                DeleteReport {
                    deleted: output.deleted,
                    failed: output.failed,
                    batches: 1,
                    listing_error: None,
                }
            }
            Err(err) => {
                tracing::warn!(bucket, keys = keys.len(), error = %err, "Bulk delete failed");
                DeleteReport {
                    deleted: Vec::new(),
                    failed: keys
                        .into_iter()
                        .map(|key| KeyFailure::new(key, err.clone()))
                        .collect(),
                    batches: 1,
                    listing_error: None,
                }
            }
        }
    }
}

fn validate_target(bucket: &str, key: &str) -> Result<(), StorageError> {
    if bucket.trim().is_empty() {
        return Err(StorageError::validation("bucket name is empty"));
    }
    stowage_common::validate_object_key(key)
        .map_err(|_| StorageError::validation(format!("invalid object key {:?}", key)))
}
