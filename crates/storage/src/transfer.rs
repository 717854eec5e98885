//! State of a single object transfer.
//!
//! A `TransferUnit` is owned by the orchestrator task that drives it and
//! observed by callers through a cloneable [`TransferHandle`]. The unit state
//! lives in a `watch` channel so waiters wake on every transition; per-part
//! bookkeeping sits behind a mutex and the byte counters are atomics, so
//! `progress()` never waits on the transfer itself.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::StorageError;
use crate::planner::PartRange;
use crate::traits::{CompletedPart, MultipartUpload};
use crate::types::{ObjectKey, Outcome, ProgressSnapshot};

/// Lifecycle of a transfer. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Request validated, not started.
    Created,
    /// Sizing the payload (staging streams) and planning parts.
    Planning,
    /// Parts are being uploaded.
    InProgress,
    /// All parts committed, finalizing.
    Completing,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Succeeded | TransferState::Failed | TransferState::Cancelled
        )
    }

    fn step(self) -> u8 {
        match self {
            TransferState::Created => 0,
            TransferState::Planning => 1,
            TransferState::InProgress => 2,
            TransferState::Completing => 3,
            TransferState::Succeeded | TransferState::Failed | TransferState::Cancelled => 4,
        }
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// The happy path advances one step at a time; `Failed` and `Cancelled`
    /// are reachable from any non-terminal state.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TransferState::Failed | TransferState::Cancelled => true,
            _ => next.step() == self.step() + 1,
        }
    }
}

/// State of one part of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Pending,
    InFlight,
    Committed,
    Failed,
}

/// One part of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPart {
    pub part_number: u32,
    pub range: PartRange,
    pub state: PartState,
    /// Set once the part is committed.
    pub etag: Option<String>,
}

/// Identifier of a transfer, unique per orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct UnitInner {
    parts: Vec<TransferPart>,
    last_error: Option<StorageError>,
    etag: Option<String>,
    upload: Option<MultipartUpload>,
}

#[derive(Debug)]
pub(crate) struct TransferUnit {
    id: TransferId,
    object: ObjectKey,
    bytes_transferred: AtomicU64,
    total_bytes: AtomicU64,
    inner: Mutex<UnitInner>,
    state: watch::Sender<TransferState>,
    cancel: watch::Sender<bool>,
    settled: watch::Sender<bool>,
}

impl TransferUnit {
    pub(crate) fn new(id: TransferId, object: ObjectKey, size_hint: Option<u64>) -> Self {
        Self {
            id,
            object,
            bytes_transferred: AtomicU64::new(0),
            total_bytes: AtomicU64::new(size_hint.unwrap_or(0)),
            inner: Mutex::new(UnitInner::default()),
            state: watch::Sender::new(TransferState::Created),
            cancel: watch::Sender::new(false),
            settled: watch::Sender::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> TransferId {
        self.id
    }

    pub(crate) fn object(&self) -> &ObjectKey {
        &self.object
    }

    pub(crate) fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Move to `next` if legal. Returns false (and changes nothing) otherwise.
    pub(crate) fn transition(&self, next: TransferState) -> bool {
        let mut from: TransferState = next;
        let moved: bool = self.state.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(
                transfer_id = %self.id,
                bucket = %self.object.bucket,
                key = %self.object.key,
                from = ?from,
                to = ?next,
                "Transfer state changed"
            );
        }
        moved
    }

    /// Set the payload size once it is known. Only valid before parts run.
    pub(crate) fn set_total(&self, total_bytes: u64) {
        self.total_bytes.store(total_bytes, Ordering::SeqCst);
    }

    pub(crate) fn set_parts(&self, ranges: &[PartRange]) {
        self.lock().parts = ranges
            .iter()
            .map(|range| TransferPart {
                part_number: range.part_number,
                range: *range,
                state: PartState::Pending,
                etag: None,
            })
            .collect();
    }

    pub(crate) fn set_upload(&self, upload: MultipartUpload) {
        self.lock().upload = Some(upload);
    }

    pub(crate) fn upload(&self) -> Option<MultipartUpload> {
        self.lock().upload.clone()
    }

    pub(crate) fn mark_in_flight(&self, part_number: u32) {
        let mut inner = self.lock();
        if let Some(part) = part_mut(&mut inner, part_number) {
            if part.state == PartState::Pending {
                part.state = PartState::InFlight;
            }
        }
    }

    pub(crate) fn fail_part(&self, part_number: u32) {
        let mut inner = self.lock();
        if let Some(part) = part_mut(&mut inner, part_number) {
            if part.state != PartState::Committed {
                part.state = PartState::Failed;
            }
        }
    }

    /// Record a committed part. Its bytes are counted exactly once.
    pub(crate) fn commit_part(&self, part_number: u32, etag: String) -> bool {
        let mut inner = self.lock();
        let Some(part) = part_mut(&mut inner, part_number) else {
            return false;
        };
        if part.state == PartState::Committed {
            return false;
        }
        part.state = PartState::Committed;
        part.etag = Some(etag);
        self.bytes_transferred.fetch_add(part.range.len(), Ordering::SeqCst);
        true
    }

    /// Committed parts in ascending order, or `None` unless every part is committed.
    pub(crate) fn completed_parts(&self) -> Option<Vec<CompletedPart>> {
        let inner = self.lock();
        let mut completed: Vec<CompletedPart> = inner
            .parts
            .iter()
            .map(|part| match (&part.state, &part.etag) {
                (PartState::Committed, Some(etag)) => Some(CompletedPart {
                    part_number: part.part_number,
                    etag: etag.clone(),
                }),
                _ => None,
            })
            .collect::<Option<Vec<CompletedPart>>>()?;
        completed.sort_by_key(|part| part.part_number);
        Some(completed)
    }

    pub(crate) fn succeed(&self, etag: String) -> bool {
        let mut inner = self.lock();
        if !self.transition(TransferState::Succeeded) {
            return false;
        }
        inner.etag = Some(etag);
        true
    }

    /// Enter `Failed` with `error` as the cause. No-op if already terminal.
    pub(crate) fn fail(&self, error: StorageError) -> bool {
        let mut inner = self.lock();
        if !self.transition(TransferState::Failed) {
            return false;
        }
        inner.last_error = Some(error);
        true
    }

    /// Signal part tasks to stop and enter `Cancelled` if not yet terminal.
    pub(crate) fn cancel(&self) -> bool {
        self.cancel.send_replace(true);
        self.transition(TransferState::Cancelled)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // The sender lives as long as `self`, so this only ends on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Mark the driving task as finished; nothing touches the store afterwards.
    pub(crate) fn mark_settled(&self) {
        self.settled.send_replace(true);
    }

    pub(crate) async fn settled(&self) {
        let mut rx = self.settled.subscribe();
        let _ = rx.wait_for(|settled| *settled).await;
    }

    pub(crate) fn progress(&self) -> ProgressSnapshot {
        let bytes: u64 = self.bytes_transferred.load(Ordering::SeqCst);
        let total: u64 = self.total_bytes.load(Ordering::SeqCst);
        ProgressSnapshot::new(
            bytes.min(total),
            total,
            self.state() == TransferState::Succeeded,
        )
    }

    fn outcome(&self, state: TransferState) -> Outcome {
        match state {
            TransferState::Succeeded => Outcome::Succeeded,
            TransferState::Cancelled => Outcome::Cancelled,
            TransferState::Failed => {
                let error: StorageError = self
                    .lock()
                    .last_error
                    .clone()
                    .unwrap_or_else(|| StorageError::transient("transfer failed"));
                Outcome::Failed(error)
            }
            _ => Outcome::TimedOut,
        }
    }
}

fn part_mut(inner: &mut UnitInner, part_number: u32) -> Option<&mut TransferPart> {
    inner
        .parts
        .iter_mut()
        .find(|part| part.part_number == part_number)
}

/// Caller-side view of a submitted transfer.
///
/// Cloning is cheap; every clone observes the same transfer.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    unit: Arc<TransferUnit>,
}

impl TransferHandle {
    pub(crate) fn new(unit: Arc<TransferUnit>) -> Self {
        Self { unit }
    }

    pub(crate) fn unit(&self) -> &Arc<TransferUnit> {
        &self.unit
    }

    pub fn id(&self) -> TransferId {
        self.unit.id()
    }

    pub fn object(&self) -> &ObjectKey {
        self.unit.object()
    }

    pub fn bucket(&self) -> &str {
        &self.unit.object().bucket
    }

    pub fn key(&self) -> &str {
        &self.unit.object().key
    }

    /// Current state.
    pub fn state(&self) -> TransferState {
        self.unit.state()
    }

    /// Non-blocking progress snapshot.
    pub fn progress(&self) -> ProgressSnapshot {
        self.unit.progress()
    }

    /// Cause of failure, once `Failed`.
    pub fn last_error(&self) -> Option<StorageError> {
        self.unit.lock().last_error.clone()
    }

    /// ETag of the stored object, once `Succeeded`.
    pub fn etag(&self) -> Option<String> {
        self.unit.lock().etag.clone()
    }

    /// Snapshot of the planned parts.
    pub fn parts(&self) -> Vec<TransferPart> {
        self.unit.lock().parts.clone()
    }

    /// Request cancellation.
    ///
    /// Parts already past their network call may still commit. Returns false
    /// if the transfer had already reached a terminal state.
    pub fn cancel(&self) -> bool {
        let cancelled: bool = self.unit.cancel();
        if cancelled {
            tracing::info!(
                transfer_id = %self.unit.id(),
                key = %self.unit.object().key,
                "Transfer cancelled"
            );
        }
        cancelled
    }

    /// Wait until the transfer is terminal or `timeout` elapses.
    ///
    /// Timing out does not cancel the transfer.
    pub async fn await_completion(&self, timeout: Option<Duration>) -> Outcome {
        let mut rx = self.unit.state.subscribe();
        let wait = async move {
            rx.wait_for(|state| state.is_terminal())
                .await
                .map(|state| *state)
        };

        let reached = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(reached) => reached,
                Err(_) => return Outcome::TimedOut,
            },
            None => wait.await,
        };

        let state: TransferState = reached.unwrap_or_else(|_| self.unit.state());
        self.unit.outcome(state)
    }
}
