//! AWS SDK S3 client implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketCannedAcl, BucketLocationConstraint, CompletedMultipartUpload,
    CompletedPart as S3CompletedPart, CreateBucketConfiguration, Delete, ObjectCannedAcl,
    ObjectIdentifier,
};
use aws_sdk_s3::Client as S3Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use stowage_storage::{
    CompletedPart, DeleteOutput, KeyFailure, ListPage, MultipartUpload, ObjectInfo,
    StorageClient, StorageError, Visibility,
};

use crate::error::CrtError;

/// Region buckets are created in without a location constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// Static AWS credentials.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Connection settings for [`CrtStorageClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// AWS region.
    pub region: String,
    /// Static credentials; the default provider chain is used when absent.
    pub credentials: Option<AwsCredentials>,
    /// Custom endpoint for S3-compatible stores.
    pub endpoint_url: Option<String>,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`.
    pub force_path_style: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            region: "us-west-2".into(),
            credentials: None,
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl ClientSettings {
    /// Settings for an S3-compatible store at `endpoint_url`, path-style.
    pub fn for_endpoint(region: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            endpoint_url: Some(endpoint_url.into()),
            force_path_style: true,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, credentials: AwsCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// StorageClient implementation using AWS SDK for Rust.
///
/// SDK-level retries are disabled; the orchestrator and reconciler retry
/// transient failures with their own policy.
#[derive(Debug, Clone)]
pub struct CrtStorageClient {
    /// The underlying S3 client.
    s3_client: S3Client,
    region: String,
}

impl CrtStorageClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `settings` - Region, optional static credentials and endpoint
    ///
    /// # Returns
    /// A new storage client.
    pub async fn new(settings: ClientSettings) -> Result<Self, StorageError> {
        if settings.region.trim().is_empty() {
            return Err(CrtError::ConfigError("region is empty".to_string()).into());
        }

        let config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()))
            .retry_config(RetryConfig::disabled());

        let config_loader = if let Some(ref creds) = settings.credentials {
            let credentials = Credentials::new(
                &creds.access_key_id,
                &creds.secret_access_key,
                creds.session_token.clone(),
                None,
                "stowage",
            );
            config_loader.credentials_provider(credentials)
        } else {
            config_loader
        };

        let sdk_config = config_loader.load().await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.force_path_style);
        if let Some(ref endpoint) = settings.endpoint_url {
            s3_config = s3_config.endpoint_url(endpoint);
        }

        tracing::debug!(
            region = %settings.region,
            endpoint = settings.endpoint_url.as_deref().unwrap_or("default"),
            "S3 client configured"
        );

        Ok(Self {
            s3_client: S3Client::from_conf(s3_config.build()),
            region: settings.region,
        })
    }

    /// Create a client from an existing S3Client (for testing).
    ///
    /// # Arguments
    /// * `s3_client` - Pre-configured S3 client
    /// * `region` - Region new buckets are created in
    pub fn from_client(s3_client: S3Client, region: impl Into<String>) -> Self {
        Self {
            s3_client,
            region: region.into(),
        }
    }

    fn location_constraint(&self) -> Option<CreateBucketConfiguration> {
        if self.region == DEFAULT_REGION {
            return None;
        }
        Some(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                .build(),
        )
    }
}

fn object_acl(visibility: Visibility) -> Option<ObjectCannedAcl> {
    match visibility {
        Visibility::Private => None,
        Visibility::PublicRead => Some(ObjectCannedAcl::PublicRead),
    }
}

fn epoch_seconds(time: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<i64> {
    time.and_then(|dt| dt.to_millis().ok()).map(|ms| ms / 1000)
}

#[async_trait]
impl StorageClient for CrtStorageClient {
    async fn create_bucket(
        &self,
        bucket: &str,
        visibility: Visibility,
    ) -> Result<(), StorageError> {
        let mut request = self
            .s3_client
            .create_bucket()
            .bucket(bucket)
            .set_create_bucket_configuration(self.location_constraint());

        if visibility == Visibility::PublicRead {
            request = request.acl(BucketCannedAcl::PublicRead);
        }

        request
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, ""))?;
        tracing::info!(bucket, region = %self.region, "Bucket created");
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.s3_client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, ""))?;
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        match self.s3_client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = CrtError::from_sdk(err);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err.into_storage(bucket, ""))
                }
            }
        }
    }

    async fn list_buckets(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let output = self
                .s3_client
                .list_buckets()
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| CrtError::from_sdk(e).into_storage("", ""))?;

            names.extend(
                output
                    .buckets()
                    .iter()
                    .filter_map(|bucket| bucket.name().map(str::to_string)),
            );
            match output.continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => return Ok(names),
            }
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        visibility: Visibility,
    ) -> Result<String, StorageError> {
        let output = self
            .s3_client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_acl(object_acl(visibility))
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, key))?;

        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        visibility: Visibility,
    ) -> Result<MultipartUpload, StorageError> {
        let output = self
            .s3_client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_acl(object_acl(visibility))
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, key))?;

        let upload_id: String = output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Service {
                code: "MissingUploadId".to_string(),
                message: format!("no upload id returned for s3://{}/{}", bucket, key),
            })?;

        Ok(MultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        data: &[u8],
    ) -> Result<String, StorageError> {
        let output = self
            .s3_client
            .upload_part()
            .bucket(&upload.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(&upload.bucket, &upload.key))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Service {
                code: "MissingETag".to_string(),
                message: format!("no ETag returned for part {}", part_number),
            })
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> Result<String, StorageError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        S3CompletedPart::builder()
                            .part_number(part.part_number as i32)
                            .e_tag(&part.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        let output = self
            .s3_client
            .complete_multipart_upload()
            .bucket(&upload.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(&upload.bucket, &upload.key))?;

        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> Result<(), StorageError> {
        let result = self
            .s3_client
            .abort_multipart_upload()
            .bucket(&upload.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = CrtError::from_sdk(err);
                // Already completed or aborted.
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err.into_storage(&upload.bucket, &upload.key))
                }
            }
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, key))?;

        let data: Vec<u8> = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::transient(e.to_string()))?
            .into_bytes()
            .to_vec();

        Ok(data)
    }

    async fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<u64, StorageError> {
        let response = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, key))?;

        let io_error = |source: std::io::Error| -> StorageError {
            CrtError::IoError {
                path: file_path.display().to_string(),
                source,
            }
            .into()
        };

        let mut file = File::create(file_path).await.map_err(io_error)?;
        let mut written: u64 = 0;
        let mut body = response.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StorageError::transient(e.to_string()))?
        {
            file.write_all(&chunk).await.map_err(io_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error)?;

        Ok(written)
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, StorageError> {
        match self.s3_client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().map(|l| l as u64).unwrap_or(0),
                last_modified: epoch_seconds(output.last_modified()),
                etag: output.e_tag().map(|s| s.to_string()),
            })),
            Err(err) => {
                let err = CrtError::from_sdk(err);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err.into_storage(bucket, key))
                }
            }
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: i32,
    ) -> Result<ListPage, StorageError> {
        let response = self
            .s3_client
            .list_objects_v2()
            .bucket(bucket)
            .set_prefix(prefix.map(str::to_string))
            .set_continuation_token(continuation_token.map(str::to_string))
            .max_keys(max_keys)
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, prefix.unwrap_or("")))?;

        let objects: Vec<ObjectInfo> = response
            .contents()
            .iter()
            .map(|obj| ObjectInfo {
                key: obj.key().unwrap_or_default().to_string(),
                size: obj.size().map(|s| s as u64).unwrap_or(0),
                last_modified: epoch_seconds(obj.last_modified()),
                etag: obj.e_tag().map(|s| s.to_string()),
            })
            .collect();

        let next_continuation_token: Option<String> = if response.is_truncated() == Some(true) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_continuation_token,
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.s3_client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, key))?;
        Ok(())
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> Result<DeleteOutput, StorageError> {
        let identifiers: Vec<ObjectIdentifier> = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<_, _>>()
            .map_err(CrtError::from)?;
        let delete: Delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(false)
            .build()
            .map_err(CrtError::from)?;

        let output = self
            .s3_client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, ""))?;

        let deleted: Vec<String> = output
            .deleted()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect();
        let failed: Vec<KeyFailure> = output
            .errors()
            .iter()
            .map(|error| {
                let key: &str = error.key().unwrap_or_default();
                let cause = CrtError::Service {
                    code: error.code().unwrap_or("Unknown").to_string(),
                    status: 0,
                    message: error.message().unwrap_or_default().to_string(),
                };
                KeyFailure::new(key, cause.into_storage(bucket, key))
            })
            .collect();

        if !failed.is_empty() {
            tracing::debug!(bucket, failed = failed.len(), "Store refused some deletes");
        }
        Ok(DeleteOutput { deleted, failed })
    }

    async fn presign_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::validation(e.to_string()))?;

        let request = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|err| CrtError::from_sdk(err).into_storage(bucket, key))?;

        Ok(request.uri().to_string())
    }
}
