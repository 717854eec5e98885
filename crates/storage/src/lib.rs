//! Transfer orchestration for S3-style object stores.
//!
//! This crate coordinates uploads, downloads and bulk deletes against any
//! backend implementing [`StorageClient`]:
//!
//! - **Part planning** - Deterministic split of a payload into byte ranges
//! - **Transfers** - Per-object state machine with progress, cancellation
//!   and retry of transient failures
//! - **Orchestrator** - Shared worker pool, stream staging, directory uploads
//! - **Reconciler** - Paginated listing and batched deletion, bucket teardown
//!
//! Backends live in their own crates (see `stowage-storage-crt`).

mod directory;
mod download;
mod error;
mod orchestrator;
pub mod planner;
mod reconciler;
mod retry;
mod traits;
mod transfer;
mod types;

pub use directory::DirectoryUploadJob;
pub use error::{ErrorKind, KeyFailure, StorageError};
pub use orchestrator::{ShutdownMode, TransferOrchestrator};
pub use planner::{plan, PartRange};
pub use reconciler::{BucketPurgeJob, BucketReconciler, DeleteReport};
pub use retry::with_retry;
pub use traits::{
    CompletedPart, DeleteOutput, ListPage, MultipartUpload, ObjectInfo, StorageClient,
};
pub use transfer::{PartState, TransferHandle, TransferId, TransferPart, TransferState};
pub use types::{
    JobState, ObjectKey, OrchestratorSettings, Outcome, ProgressSnapshot, PurgeSettings,
    RetrySettings, TransferRequest, TransferSource, UploadOptions, Visibility,
};
