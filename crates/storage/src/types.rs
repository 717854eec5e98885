//! Shared data structures for storage operations.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stowage_common::{
    DEFAULT_LIST_PAGE_SIZE, DEFAULT_MAX_PART_SIZE, DEFAULT_MAX_RETRIES, DELETE_BATCH_LIMIT,
};
use tokio::io::AsyncRead;

use crate::error::StorageError;

/// Bucket and key of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub bucket: String,
    pub key: String,
}

impl ObjectKey {
    /// Create a new object key.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Canned access policy applied to an object or bucket at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    #[default]
    Private,
    PublicRead,
}

/// Where the bytes of an upload come from.
pub enum TransferSource {
    /// Local file, read by range.
    File(PathBuf),
    /// In-memory bytes.
    Bytes(Vec<u8>),
    /// Single-pass stream, staged to a local file before upload.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for TransferSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferSource::File(path) => f.debug_tuple("File").field(path).finish(),
            TransferSource::Bytes(data) => f
                .debug_struct("Bytes")
                .field("len", &data.len())
                .finish(),
            TransferSource::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// Per-operation upload options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadOptions {
    /// Canned access policy for the new object.
    pub visibility: Visibility,
    /// Part size for this upload instead of the orchestrator default.
    pub part_size_override: Option<u64>,
    /// Maximum parts of this upload in flight at once. The shared pool
    /// still bounds the total.
    pub concurrency_override: Option<usize>,
}

impl UploadOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the object visibility.
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Override the part size for this upload.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size_override = Some(part_size);
        self
    }

    /// Limit how many parts of this upload run at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency_override = Some(concurrency);
        self
    }
}

/// Request to upload one object. Immutable once submitted.
#[derive(Debug)]
pub struct TransferRequest {
    pub bucket: String,
    pub key: String,
    pub source: TransferSource,
    /// Expected size, used for progress until the real size is known.
    pub size_hint: Option<u64>,
    pub options: UploadOptions,
}

impl TransferRequest {
    /// Upload from a local file.
    pub fn from_file(
        bucket: impl Into<String>,
        key: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(bucket, key, TransferSource::File(path.into()))
    }

    /// Upload in-memory bytes.
    pub fn from_bytes(bucket: impl Into<String>, key: impl Into<String>, data: Vec<u8>) -> Self {
        let size: u64 = data.len() as u64;
        let mut request = Self::new(bucket, key, TransferSource::Bytes(data));
        request.size_hint = Some(size);
        request
    }

    /// Upload from a single-pass stream.
    pub fn from_reader<R>(bucket: impl Into<String>, key: impl Into<String>, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::new(bucket, key, TransferSource::Reader(Box::new(reader)))
    }

    fn new(bucket: impl Into<String>, key: impl Into<String>, source: TransferSource) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            source,
            size_hint: None,
            options: UploadOptions::default(),
        }
    }

    /// Set the expected size.
    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    /// Set the upload options.
    pub fn with_options(mut self, options: UploadOptions) -> Self {
        self.options = options;
        self
    }
}

/// Retry settings for part transfers and batch requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt (so `max_retries + 1` attempts in total).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Backoff multiplier (exponential backoff).
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    /// Settings that never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the retry bound.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial backoff delay.
    pub fn with_initial_backoff_ms(mut self, initial_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    /// Delay before retry number `retry` (1-based), capped at `max_backoff_ms`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent: i32 = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay: f64 = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped: f64 = delay.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Configuration for a [`TransferOrchestrator`](crate::TransferOrchestrator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Objects larger than this are uploaded in parts of this size.
    pub max_part_size: u64,
    /// Maximum concurrent network operations across all transfers.
    pub pool_size: usize,
    /// Retry policy for part uploads.
    pub retry: RetrySettings,
    /// Parent directory for staged streams (system temp dir if unset).
    pub staging_root: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let pool_size: usize = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_part_size: DEFAULT_MAX_PART_SIZE,
            pool_size,
            retry: RetrySettings::default(),
            staging_root: None,
        }
    }
}

impl OrchestratorSettings {
    /// Set the maximum part size.
    pub fn with_max_part_size(mut self, max_part_size: u64) -> Self {
        self.max_part_size = max_part_size;
        self
    }

    /// Set the worker pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Stage streams below `root`.
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }
}

/// Configuration for a [`BucketReconciler`](crate::BucketReconciler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeSettings {
    /// Keys per bulk delete request.
    pub batch_limit: usize,
    /// Keys requested per listing page.
    pub page_size: i32,
    /// Retry policy for list and delete requests.
    pub retry: RetrySettings,
}

impl Default for PurgeSettings {
    fn default() -> Self {
        Self {
            batch_limit: DELETE_BATCH_LIMIT,
            page_size: DEFAULT_LIST_PAGE_SIZE,
            retry: RetrySettings::default(),
        }
    }
}

impl PurgeSettings {
    /// Set the bulk delete batch size.
    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    /// Set the listing page size.
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }
}

/// Point-in-time progress of a transfer or job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 0.0 to 100.0.
    pub percent: f64,
}

impl ProgressSnapshot {
    /// Build a snapshot. An empty payload reports 100% once `complete`.
    pub fn new(bytes_transferred: u64, total_bytes: u64, complete: bool) -> Self {
        let percent: f64 = if total_bytes == 0 {
            if complete {
                100.0
            } else {
                0.0
            }
        } else {
            (bytes_transferred as f64 / total_bytes as f64 * 100.0).min(100.0)
        };
        Self {
            bytes_transferred,
            total_bytes,
            percent,
        }
    }
}

/// Result of waiting for a transfer or job.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeeded,
    Failed(StorageError),
    Cancelled,
    /// The wait timed out; the work keeps running.
    TimedOut,
}

impl Outcome {
    /// Whether this outcome is `Succeeded`.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// Aggregate state of a multi-object job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::new("bucket", "dir/file.txt");
        assert_eq!(key.to_string(), "s3://bucket/dir/file.txt");
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetrySettings {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(400));
        assert_eq!(retry.backoff_for(5), Duration::from_millis(1_000));
        assert_eq!(retry.backoff_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_orchestrator_settings_defaults() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.max_part_size, DEFAULT_MAX_PART_SIZE);
        assert!(settings.pool_size >= 1);
        assert_eq!(settings.retry.max_retries, 3);
        assert!(settings.staging_root.is_none());
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: OrchestratorSettings =
            serde_json::from_str(r#"{"max_part_size": 5242880, "retry": {"max_retries": 1}}"#)
                .unwrap();
        assert_eq!(settings.max_part_size, 5 * 1024 * 1024);
        assert_eq!(settings.retry.max_retries, 1);
        assert_eq!(settings.retry.initial_backoff_ms, 100);

        let purge: PurgeSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(purge.batch_limit, 1000);
    }

    #[test]
    fn test_upload_options_builders() {
        let options = UploadOptions::new()
            .with_visibility(Visibility::PublicRead)
            .with_part_size(1024)
            .with_concurrency(2);
        assert_eq!(options.visibility, Visibility::PublicRead);
        assert_eq!(options.part_size_override, Some(1024));
        assert_eq!(options.concurrency_override, Some(2));

        let parsed: UploadOptions = serde_json::from_str(r#"{"visibility": "public-read"}"#).unwrap();
        assert_eq!(parsed.visibility, Visibility::PublicRead);
    }

    #[test]
    fn test_progress_snapshot_percent() {
        assert_eq!(ProgressSnapshot::new(50, 200, false).percent, 25.0);
        assert_eq!(ProgressSnapshot::new(0, 0, false).percent, 0.0);
        assert_eq!(ProgressSnapshot::new(0, 0, true).percent, 100.0);
    }

    #[test]
    fn test_from_bytes_sets_size_hint() {
        let request = TransferRequest::from_bytes("b", "k", vec![0u8; 7]);
        assert_eq!(request.size_hint, Some(7));
        assert!(matches!(request.source, TransferSource::Bytes(_)));
    }
}
