//! Storage traits/interfaces for object store operations.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{KeyFailure, StorageError};
use crate::types::Visibility;

/// Information about an object from list/head operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modified timestamp (Unix epoch seconds).
    pub last_modified: Option<i64>,
    /// ETag assigned by the store.
    pub etag: Option<String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects in this page, in store order.
    pub objects: Vec<ObjectInfo>,
    /// Token for the next page, `None` when the listing is complete.
    pub next_continuation_token: Option<String>,
}

/// An initiated multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub bucket: String,
    pub key: String,
    /// Store-assigned upload identifier.
    pub upload_id: String,
}

/// A committed part handed to the finalize call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,
    pub etag: String,
}

/// Per-key outcome of a single bulk delete request.
#[derive(Debug, Clone, Default)]
pub struct DeleteOutput {
    /// Keys the store reported as deleted.
    pub deleted: Vec<String>,
    /// Keys the store refused to delete.
    pub failed: Vec<KeyFailure>,
}

/// Primitive object store operations - implemented by each backend.
///
/// Implementations must be safe to share across tasks; a single client is
/// injected into the orchestrator and reconciler and used concurrently.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Create a bucket with the given canned visibility.
    async fn create_bucket(&self, bucket: &str, visibility: Visibility)
        -> Result<(), StorageError>;

    /// Delete an (empty) bucket.
    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Check whether a bucket exists and is accessible.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    /// Names of every bucket visible to the caller.
    async fn list_buckets(&self) -> Result<Vec<String>, StorageError>;

    /// Upload an object in one request.
    ///
    /// # Returns
    /// The ETag of the new object.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        visibility: Visibility,
    ) -> Result<String, StorageError>;

    /// Start a multipart upload.
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        visibility: Visibility,
    ) -> Result<MultipartUpload, StorageError>;

    /// Upload one part of a multipart upload.
    ///
    /// # Returns
    /// The ETag of the part.
    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        data: &[u8],
    ) -> Result<String, StorageError>;

    /// Finalize a multipart upload from its committed parts.
    ///
    /// `parts` is in ascending part-number order.
    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> Result<String, StorageError>;

    /// Abort a multipart upload, discarding its parts.
    async fn abort_multipart(&self, upload: &MultipartUpload) -> Result<(), StorageError>;

    /// Download an object to bytes.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Download an object to a local file (streaming).
    ///
    /// # Returns
    /// Number of bytes written.
    async fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<u64, StorageError>;

    /// Return object metadata, or `None` if the object does not exist.
    async fn head_object(&self, bucket: &str, key: &str)
        -> Result<Option<ObjectInfo>, StorageError>;

    /// List one page of objects.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: i32,
    ) -> Result<ListPage, StorageError>;

    /// Delete a single object. Deleting a missing key succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Delete up to the store's per-request maximum of keys in one request.
    async fn delete_objects(&self, bucket: &str, keys: &[String])
        -> Result<DeleteOutput, StorageError>;

    /// Produce a time-limited URL for an object.
    async fn presign_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError>;
}
