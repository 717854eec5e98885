//! Directory upload jobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{KeyFailure, StorageError};
use crate::transfer::{TransferHandle, TransferState};
use crate::types::{JobState, Outcome, ProgressSnapshot};

/// The set of transfers started by one directory upload.
///
/// Returned by [`TransferOrchestrator::upload_directory`](crate::TransferOrchestrator::upload_directory).
#[derive(Debug, Clone)]
pub struct DirectoryUploadJob {
    root_path: PathBuf,
    bucket: String,
    key_prefix: String,
    units: Vec<TransferHandle>,
}

impl DirectoryUploadJob {
    pub(crate) fn new(
        root_path: PathBuf,
        bucket: &str,
        key_prefix: &str,
        units: Vec<TransferHandle>,
    ) -> Self {
        Self {
            root_path,
            bucket: bucket.to_string(),
            key_prefix: key_prefix.to_string(),
            units,
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// One transfer per uploaded file.
    pub fn units(&self) -> &[TransferHandle] {
        &self.units
    }

    /// Aggregate state.
    ///
    /// `InProgress` while any transfer is unfinished. Once all are terminal:
    /// `Failed` if any failed, else `Cancelled` if any was cancelled, else
    /// `Succeeded`. An empty job has succeeded.
    pub fn state(&self) -> JobState {
        let states: Vec<TransferState> = self.units.iter().map(TransferHandle::state).collect();
        if states.iter().any(|state| !state.is_terminal()) {
            JobState::InProgress
        } else if states.contains(&TransferState::Failed) {
            JobState::Failed
        } else if states.contains(&TransferState::Cancelled) {
            JobState::Cancelled
        } else {
            JobState::Succeeded
        }
    }

    /// Sum of the progress of every transfer.
    pub fn progress(&self) -> ProgressSnapshot {
        let (bytes, total) = self
            .units
            .iter()
            .map(TransferHandle::progress)
            .fold((0u64, 0u64), |(bytes, total), p| {
                (bytes + p.bytes_transferred, total + p.total_bytes)
            });
        ProgressSnapshot::new(bytes, total, self.state() == JobState::Succeeded)
    }

    /// Cancel every unfinished transfer. Finished uploads are not rolled back.
    ///
    /// # Returns
    /// Number of transfers cancelled.
    pub fn cancel(&self) -> usize {
        let cancelled: usize = self.units.iter().filter(|unit| unit.cancel()).count();
        tracing::info!(
            bucket = %self.bucket,
            key_prefix = %self.key_prefix,
            cancelled,
            "Directory upload cancelled"
        );
        cancelled
    }

    /// Transfers that failed, with their cause.
    pub fn failures(&self) -> Vec<KeyFailure> {
        self.units
            .iter()
            .filter(|unit| unit.state() == TransferState::Failed)
            .map(|unit| {
                let error: StorageError = unit
                    .last_error()
                    .unwrap_or_else(|| StorageError::transient("transfer failed"));
                KeyFailure::new(unit.key(), error)
            })
            .collect()
    }

    /// Wait until every transfer is terminal or `timeout` elapses.
    ///
    /// Timing out does not cancel anything. A job with a failed transfer
    /// reports the first failure as its cause.
    pub async fn await_completion(&self, timeout: Option<Duration>) -> Outcome {
        let deadline: Option<Instant> = timeout.map(|limit| Instant::now() + limit);

        for unit in &self.units {
            let remaining: Option<Duration> =
                deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if let Outcome::TimedOut = unit.await_completion(remaining).await {
                return Outcome::TimedOut;
            }
        }

        match self.state() {
            JobState::Succeeded => Outcome::Succeeded,
            JobState::Cancelled => Outcome::Cancelled,
            JobState::Failed => match self.failures().into_iter().next() {
                Some(failure) => Outcome::Failed(failure.error),
                None => Outcome::Failed(StorageError::transient("transfer failed")),
            },
            JobState::InProgress => Outcome::TimedOut,
        }
    }
}
