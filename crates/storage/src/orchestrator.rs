//! Transfer orchestration.
//!
//! This module drives object uploads against any `StorageClient`
//! implementation. It handles:
//!
//! - Single-request uploads for payloads up to the part size
//! - Multipart uploads with concurrent parts and an all-or-nothing finalize
//! - Staging of single-pass streams so parts can be re-read on retry
//! - Bounded retry with backoff on transient failures
//! - Progress snapshots, cancellation and explicit abort
//! - Directory uploads (one transfer per file)
//!
//! # Concurrency
//!
//! Every network call made on behalf of a transfer holds a permit from one
//! semaphore shared by all transfers, so `pool_size` bounds concurrent
//! requests rather than concurrent transfers. The permit covers one attempt;
//! retry backoff runs without it. An upload may further limit
//! its own parts with `UploadOptions::concurrency_override`.
//!
//! # Example
//!
//! ```ignore
//! use stowage_storage::{OrchestratorSettings, TransferOrchestrator, TransferRequest};
//!
//! let orchestrator = TransferOrchestrator::new(client, OrchestratorSettings::default())?;
//! let handle = orchestrator.submit(TransferRequest::from_file("bucket", "big.bin", "/data/big.bin"))?;
//! let outcome = handle.await_completion(None).await;
//! orchestrator.shutdown(ShutdownMode::Drain).await?;
//! ```

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stowage_common::{directory_marker_key, join_key, validate_object_key, KEY_SEPARATOR};
use stowage_filesystem::{DirectoryWalker, FileSystemError, StagedFile, Stager, WalkEntry};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::{JoinHandle, JoinSet};

use crate::directory::DirectoryUploadJob;
use crate::error::StorageError;
use crate::planner::{self, PartRange};
use crate::retry::with_retry;
use crate::traits::{CompletedPart, MultipartUpload, StorageClient};
use crate::transfer::{TransferHandle, TransferId, TransferState, TransferUnit};
use crate::types::{
    ObjectKey, OrchestratorSettings, TransferRequest, TransferSource, UploadOptions, Visibility,
};

/// How [`TransferOrchestrator::shutdown`] treats unfinished transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let every transfer run to a terminal state.
    Drain,
    /// Cancel every unfinished transfer first.
    Cancel,
}

struct Registered {
    unit: Arc<TransferUnit>,
    task: JoinHandle<()>,
}

struct Registry {
    accepting: bool,
    entries: Vec<Registered>,
}

pub(crate) struct Shared<C: ?Sized> {
    pub(crate) client: Arc<C>,
    pub(crate) settings: OrchestratorSettings,
    pub(crate) pool: Semaphore,
    stager: Stager,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl<C: ?Sized> Shared<C> {
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives object transfers using any StorageClient implementation.
///
/// Cloning is cheap and every clone shares the worker pool, staging
/// directory and transfer registry.
pub struct TransferOrchestrator<C: StorageClient + ?Sized + 'static> {
    pub(crate) shared: Arc<Shared<C>>,
}

impl<C: StorageClient + ?Sized + 'static> Clone for TransferOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: StorageClient + ?Sized + 'static> TransferOrchestrator<C> {
    /// Create a new orchestrator.
    ///
    /// # Arguments
    /// * `client` - Shared storage client for all transfers
    /// * `settings` - Part size, pool size, retry policy and staging root
    ///
    /// # Errors
    /// * `InvalidSize` if `max_part_size` is zero
    /// * `Validation` if `pool_size` is zero
    /// * `IoError` if the staging directory cannot be created
    pub fn new(client: Arc<C>, settings: OrchestratorSettings) -> Result<Self, StorageError> {
        if settings.max_part_size == 0 {
            return Err(StorageError::InvalidSize {
                total_bytes: 0,
                max_part_size: 0,
            });
        }
        if settings.pool_size == 0 {
            return Err(StorageError::validation("pool_size must be at least 1"));
        }

        let stager: Stager = match &settings.staging_root {
            Some(root) => Stager::in_dir(root)?,
            None => Stager::new()?,
        };

        tracing::debug!(
            max_part_size = settings.max_part_size,
            pool_size = settings.pool_size,
            staging_root = %stager.root().display(),
            "Transfer orchestrator started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                pool: Semaphore::new(settings.pool_size),
                settings,
                stager,
                next_id: AtomicU64::new(0),
                registry: Mutex::new(Registry {
                    accepting: true,
                    entries: Vec::new(),
                }),
            }),
        })
    }

    /// Settings this orchestrator was created with.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.shared.settings
    }

    /// The shared storage client.
    pub fn client(&self) -> &Arc<C> {
        &self.shared.client
    }

    /// Directory holding staged streams.
    pub fn staging_root(&self) -> &Path {
        self.shared.stager.root()
    }

    /// Number of transfers whose driving task has not finished.
    pub fn active_transfers(&self) -> usize {
        self.shared
            .lock_registry()
            .entries
            .iter()
            .filter(|entry| !entry.task.is_finished())
            .count()
    }

    /// Submit a transfer and start it in the background.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// * `Validation` for an empty bucket, an empty or absolute key, a zero
    ///   concurrency override, or after shutdown
    /// * `InvalidSize` for a zero part size override
    pub fn submit(&self, request: TransferRequest) -> Result<TransferHandle, StorageError> {
        validate_request(&request)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StorageError::validation("transfers must be submitted inside a Tokio runtime")
        })?;

        let TransferRequest {
            bucket,
            key,
            source,
            size_hint,
            options,
        } = request;

        let mut registry = self.shared.lock_registry();
        if !registry.accepting {
            return Err(StorageError::validation("orchestrator has been shut down"));
        }
        registry.entries.retain(|entry| !entry.task.is_finished());

        let id = TransferId(self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let unit = Arc::new(TransferUnit::new(id, ObjectKey::new(bucket, key), size_hint));
        let task: JoinHandle<()> = runtime.spawn(run_transfer(
            Arc::clone(&self.shared),
            Arc::clone(&unit),
            source,
            options,
        ));
        registry.entries.push(Registered {
            unit: Arc::clone(&unit),
            task,
        });

        tracing::debug!(
            transfer_id = %id,
            bucket = %unit.object().bucket,
            key = %unit.object().key,
            "Transfer submitted"
        );
        Ok(TransferHandle::new(unit))
    }

    /// Upload one object.
    pub fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        source: TransferSource,
        options: UploadOptions,
    ) -> Result<TransferHandle, StorageError> {
        self.submit(TransferRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
            size_hint: None,
            options,
        })
    }

    /// Upload every file below `root_path`, keyed by its path relative to
    /// the root under `key_prefix`.
    ///
    /// A regular file root uploads that single file under its own name.
    ///
    /// # Errors
    /// * `PathNotFound` if the root does not exist
    /// * `NotADirectory` if the root is neither a file nor a directory
    /// * `IoError` if the tree cannot be read
    /// * any `submit` error; transfers already submitted are cancelled
    pub async fn upload_directory(
        &self,
        bucket: &str,
        key_prefix: &str,
        root_path: impl AsRef<Path>,
        options: UploadOptions,
    ) -> Result<DirectoryUploadJob, StorageError> {
        if bucket.trim().is_empty() {
            return Err(StorageError::validation("bucket name is empty"));
        }
        let root: PathBuf = root_path.as_ref().to_path_buf();

        let walker = DirectoryWalker::new(root.clone());
        let entries: Vec<WalkEntry> =
            tokio::task::spawn_blocking(move || -> Result<Vec<WalkEntry>, FileSystemError> {
                walker.walk()?.collect()
            })
            .await
            .map_err(|e| StorageError::IoError {
                path: root.display().to_string(),
                message: e.to_string(),
            })??;

        let mut units: Vec<TransferHandle> = Vec::with_capacity(entries.len());
        for entry in entries {
            let key: String = join_key(key_prefix, &entry.relative_key);
            let request = TransferRequest::from_file(bucket, key, entry.path)
                .with_size_hint(entry.size)
                .with_options(options.clone());
            match self.submit(request) {
                Ok(handle) => units.push(handle),
                Err(err) => {
                    for unit in &units {
                        unit.cancel();
                    }
                    return Err(err);
                }
            }
        }

        tracing::info!(
            bucket,
            key_prefix,
            root = %root.display(),
            files = units.len(),
            "Directory upload submitted"
        );
        Ok(DirectoryUploadJob::new(root, bucket, key_prefix, units))
    }

    /// Create a virtual directory by uploading its zero-length marker `name/`.
    pub fn create_directory(
        &self,
        bucket: &str,
        name: &str,
        visibility: Visibility,
    ) -> Result<TransferHandle, StorageError> {
        if name.trim_matches(KEY_SEPARATOR).is_empty() {
            return Err(StorageError::validation("directory name is empty"));
        }
        let request = TransferRequest::from_bytes(bucket, directory_marker_key(name), Vec::new())
            .with_options(UploadOptions::new().with_visibility(visibility));
        self.submit(request)
    }

    /// Best-effort abort of a multipart upload left behind by a transfer.
    ///
    /// An unfinished transfer is cancelled first. Once its task has stopped,
    /// the store is asked to discard the committed parts. Failure to abort is
    /// logged, not returned.
    ///
    /// # Returns
    /// True if an abort request was acknowledged by the store.
    pub async fn abort(&self, handle: &TransferHandle) -> bool {
        let unit: &Arc<TransferUnit> = handle.unit();
        if !unit.state().is_terminal() {
            unit.cancel();
        }
        unit.settled().await;

        if unit.state() == TransferState::Succeeded {
            return false;
        }
        let Some(upload) = unit.upload() else {
            return false;
        };

        let client: &C = &self.shared.client;
        let upload_ref: &MultipartUpload = &upload;
        let result = with_retry(&self.shared.settings.retry, "abort_multipart", move || async move {
            client.abort_multipart(upload_ref).await
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    transfer_id = %unit.id(),
                    key = %upload.key,
                    upload_id = %upload.upload_id,
                    "Multipart upload aborted"
                );
                true
            }
            Err(err) => {
                tracing::warn!(
                    transfer_id = %unit.id(),
                    key = %upload.key,
                    upload_id = %upload.upload_id,
                    error = %err,
                    "Failed to abort multipart upload"
                );
                false
            }
        }
    }

    /// Stop accepting transfers, wait for the running ones and remove every
    /// staged file.
    ///
    /// The staging directory itself is removed when the last clone of the
    /// orchestrator is dropped.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), StorageError> {
        let entries: Vec<Registered> = {
            let mut registry = self.shared.lock_registry();
            registry.accepting = false;
            std::mem::take(&mut registry.entries)
        };

        tracing::info!(
            mode = ?mode,
            pending = entries.len(),
            "Shutting down transfer orchestrator"
        );

        if mode == ShutdownMode::Cancel {
            for entry in &entries {
                entry.unit.cancel();
            }
        }

        for Registered { unit, task } in entries {
            if let Err(err) = task.await {
                tracing::error!(
                    transfer_id = %unit.id(),
                    error = %err,
                    "Transfer task ended abnormally"
                );
            }
        }

        let removed: usize = self.shared.stager.purge()?;
        if removed > 0 {
            tracing::warn!(removed, "Removed leftover staged files");
        }
        Ok(())
    }
}

fn validate_request(request: &TransferRequest) -> Result<(), StorageError> {
    if request.bucket.trim().is_empty() {
        return Err(StorageError::validation("bucket name is empty"));
    }
    validate_object_key(&request.key).map_err(|_| {
        StorageError::validation(format!(
            "invalid object key {:?}: keys must be non-empty and must not start with '/'",
            request.key
        ))
    })?;
    if request.options.part_size_override == Some(0) {
        return Err(StorageError::InvalidSize {
            total_bytes: request.size_hint.unwrap_or(0),
            max_part_size: 0,
        });
    }
    if request.options.concurrency_override == Some(0) {
        return Err(StorageError::validation("concurrency override must be at least 1"));
    }
    Ok(())
}

/// Bytes of a transfer that can be read by range any number of times.
#[derive(Debug, Clone)]
enum Payload {
    File { path: Arc<PathBuf>, len: u64 },
    Memory(Arc<Vec<u8>>),
}

impl Payload {
    fn len(&self) -> u64 {
        match self {
            Payload::File { len, .. } => *len,
            Payload::Memory(data) => data.len() as u64,
        }
    }

    async fn read_range(&self, range: PartRange) -> Result<Vec<u8>, StorageError> {
        match self {
            Payload::Memory(data) => Ok(data[range.start as usize..range.end as usize].to_vec()),
            Payload::File { path, .. } => {
                let io_error = |e: std::io::Error| StorageError::IoError {
                    path: path.display().to_string(),
                    message: e.to_string(),
                };
                let mut file = tokio::fs::File::open(path.as_path()).await.map_err(io_error)?;
                file.seek(SeekFrom::Start(range.start))
                    .await
                    .map_err(io_error)?;
                let mut buffer: Vec<u8> = vec![0u8; range.len() as usize];
                file.read_exact(&mut buffer).await.map_err(io_error)?;
                Ok(buffer)
            }
        }
    }
}

/// A pool permit for one request attempt. Never held across a retry backoff.
pub(crate) async fn acquire(pool: &Semaphore) -> Result<SemaphorePermit<'_>, StorageError> {
    pool.acquire().await.map_err(|_| StorageError::Cancelled)
}

/// Marks the unit settled however the driving task ends.
struct SettleOnDrop<'a>(&'a TransferUnit);

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.mark_settled();
    }
}

async fn run_transfer<C: StorageClient + ?Sized + 'static>(
    shared: Arc<Shared<C>>,
    unit: Arc<TransferUnit>,
    source: TransferSource,
    options: UploadOptions,
) {
    let _settle = SettleOnDrop(&unit);

    match drive(&shared, &unit, source, &options).await {
        Ok(()) => {
            tracing::debug!(
                transfer_id = %unit.id(),
                bucket = %unit.object().bucket,
                key = %unit.object().key,
                "Transfer succeeded"
            );
        }
        Err(StorageError::Cancelled) => {
            unit.cancel();
        }
        Err(err) => {
            if unit.fail(err.clone()) {
                tracing::error!(
                    transfer_id = %unit.id(),
                    bucket = %unit.object().bucket,
                    key = %unit.object().key,
                    error = %err,
                    "Transfer failed"
                );
            }
        }
    }
}

async fn drive<C: StorageClient + ?Sized + 'static>(
    shared: &Arc<Shared<C>>,
    unit: &Arc<TransferUnit>,
    source: TransferSource,
    options: &UploadOptions,
) -> Result<(), StorageError> {
    if !unit.transition(TransferState::Planning) {
        return Err(StorageError::Cancelled);
    }
    let part_size: u64 = options
        .part_size_override
        .unwrap_or(shared.settings.max_part_size);

    // A staged stream must outlive every read of its parts.
    let (payload, _staged): (Payload, Option<StagedFile>) =
        prepare_payload(shared, unit, source).await?;

    let total_bytes: u64 = payload.len();
    unit.set_total(total_bytes);
    planner::check_part_count(total_bytes, part_size)?;
    let ranges: Vec<PartRange> = planner::plan(total_bytes, part_size)?;
    unit.set_parts(&ranges);

    if !unit.transition(TransferState::InProgress) {
        return Err(StorageError::Cancelled);
    }

    let etag: String = match ranges.as_slice() {
        [single] => upload_single(shared, unit, &payload, *single, options).await?,
        _ => upload_multipart(shared, unit, payload.clone(), &ranges, options).await?,
    };

    if !unit.succeed(etag) {
        return Err(StorageError::Cancelled);
    }
    Ok(())
}

async fn prepare_payload<C: ?Sized>(
    shared: &Shared<C>,
    unit: &TransferUnit,
    source: TransferSource,
) -> Result<(Payload, Option<StagedFile>), StorageError> {
    match source {
        TransferSource::Bytes(data) => Ok((Payload::Memory(Arc::new(data)), None)),
        TransferSource::File(path) => {
            let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::PathNotFound {
                        path: path.display().to_string(),
                    }
                } else {
                    StorageError::IoError {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    }
                }
            })?;
            if !metadata.is_file() {
                return Err(StorageError::validation(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
            let payload = Payload::File {
                path: Arc::new(path),
                len: metadata.len(),
            };
            Ok((payload, None))
        }
        TransferSource::Reader(mut reader) => {
            let staged: StagedFile = tokio::select! {
                _ = unit.cancelled() => return Err(StorageError::Cancelled),
                staged = shared.stager.stage(&mut reader) => staged?,
            };
            tracing::debug!(
                transfer_id = %unit.id(),
                bytes = staged.size(),
                path = %staged.path().display(),
                "Stream staged"
            );
            let payload = Payload::File {
                path: Arc::new(staged.path().to_path_buf()),
                len: staged.size(),
            };
            Ok((payload, Some(staged)))
        }
    }
}

async fn upload_single<C: StorageClient + ?Sized + 'static>(
    shared: &Shared<C>,
    unit: &TransferUnit,
    payload: &Payload,
    range: PartRange,
    options: &UploadOptions,
) -> Result<String, StorageError> {
    let data: Vec<u8> = payload.read_range(range).await?;
    unit.mark_in_flight(range.part_number);

    let client: &C = &shared.client;
    let pool: &Semaphore = &shared.pool;
    let object: &ObjectKey = unit.object();
    let (bucket, key) = (object.bucket.as_str(), object.key.as_str());
    let body: &[u8] = &data;
    let visibility: Visibility = options.visibility;

    let put = with_retry(&shared.settings.retry, "put_object", move || async move {
        let _permit = acquire(pool).await?;
        client.put_object(bucket, key, body, visibility).await
    });
    let result: Result<String, StorageError> = tokio::select! {
        _ = unit.cancelled() => Err(StorageError::Cancelled),
        result = put => result,
    };

    let etag: String = match result {
        Ok(etag) => etag,
        Err(err) => {
            unit.fail_part(range.part_number);
            return Err(err);
        }
    };
    unit.commit_part(range.part_number, etag.clone());

    if !unit.transition(TransferState::Completing) {
        return Err(StorageError::Cancelled);
    }
    Ok(etag)
}

async fn upload_multipart<C: StorageClient + ?Sized + 'static>(
    shared: &Arc<Shared<C>>,
    unit: &Arc<TransferUnit>,
    payload: Payload,
    ranges: &[PartRange],
    options: &UploadOptions,
) -> Result<String, StorageError> {
    let client: &C = &shared.client;
    let pool: &Semaphore = &shared.pool;
    let object: &ObjectKey = unit.object();
    let (bucket, key) = (object.bucket.as_str(), object.key.as_str());
    let visibility: Visibility = options.visibility;

    let upload: MultipartUpload = {
        let initiate = with_retry(&shared.settings.retry, "initiate_multipart", move || async move {
            let _permit = acquire(pool).await?;
            client.initiate_multipart(bucket, key, visibility).await
        });
        tokio::select! {
            _ = unit.cancelled() => return Err(StorageError::Cancelled),
            result = initiate => result?,
        }
    };
    unit.set_upload(upload.clone());
    tracing::debug!(
        transfer_id = %unit.id(),
        upload_id = %upload.upload_id,
        parts = ranges.len(),
        "Multipart upload initiated"
    );

    let upload = Arc::new(upload);
    let unit_limit: Option<Arc<Semaphore>> = options
        .concurrency_override
        .map(|limit| Arc::new(Semaphore::new(limit)));

    let mut tasks: JoinSet<Result<(), StorageError>> = JoinSet::new();
    for range in ranges {
        tasks.spawn(upload_part(
            Arc::clone(shared),
            Arc::clone(unit),
            Arc::clone(&upload),
            payload.clone(),
            *range,
            unit_limit.clone(),
        ));
    }

    // Finalize only after every part task has reported.
    let mut first_error: Option<StorageError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result: Result<(), StorageError> = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => continue,
            Err(e) => Err(StorageError::Service {
                code: "PartTaskPanicked".to_string(),
                message: e.to_string(),
            }),
        };
        if let Err(err) = result {
            if first_error.is_none() {
                tasks.abort_all();
                first_error = Some(err);
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    if unit.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let parts: Vec<CompletedPart> = unit.completed_parts().ok_or_else(|| StorageError::Service {
        code: "IncompleteUpload".to_string(),
        message: format!("not every part of {} was committed", object),
    })?;

    if !unit.transition(TransferState::Completing) {
        return Err(StorageError::Cancelled);
    }

    let upload_ref: &MultipartUpload = &upload;
    let parts_ref: &[CompletedPart] = &parts;
    with_retry(&shared.settings.retry, "complete_multipart", move || async move {
        let _permit = acquire(pool).await?;
        client.complete_multipart(upload_ref, parts_ref).await
    })
    .await
}

async fn upload_part<C: StorageClient + ?Sized + 'static>(
    shared: Arc<Shared<C>>,
    unit: Arc<TransferUnit>,
    upload: Arc<MultipartUpload>,
    payload: Payload,
    range: PartRange,
    unit_limit: Option<Arc<Semaphore>>,
) -> Result<(), StorageError> {
    let part_number: u32 = range.part_number;

    let work = async {
        let _unit_permit = match unit_limit.as_deref() {
            Some(limit) => Some(acquire(limit).await?),
            None => None,
        };
        unit.mark_in_flight(part_number);

        let data: Vec<u8> = payload.read_range(range).await?;
        let client: &C = &shared.client;
        let pool: &Semaphore = &shared.pool;
        let upload_ref: &MultipartUpload = &upload;
        let body: &[u8] = &data;
        let etag: String = with_retry(&shared.settings.retry, "upload_part", move || async move {
            let _permit = acquire(pool).await?;
            client.upload_part(upload_ref, part_number, body).await
        })
        .await?;

        unit.commit_part(part_number, etag);
        tracing::debug!(
            transfer_id = %unit.id(),
            part_number,
            bytes = range.len(),
            "Part committed"
        );
        Ok::<(), StorageError>(())
    };

    let result: Result<(), StorageError> = tokio::select! {
        _ = unit.cancelled() => Err(StorageError::Cancelled),
        result = work => result,
    };
    if result.is_err() {
        unit.fail_part(part_number);
    }
    result
}
