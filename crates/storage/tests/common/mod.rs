//! In-memory object store used by the integration tests.
//!
//! `FakeStore` keeps buckets in ordered maps, records every call it
//! receives and can be told to fail specific requests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use stowage_storage::{
    CompletedPart, DeleteOutput, KeyFailure, ListPage, MultipartUpload, ObjectInfo,
    OrchestratorSettings, PurgeSettings, RetrySettings, StorageClient, StorageError,
    TransferOrchestrator, Visibility,
};

pub const MIB: u64 = 1024 * 1024;

/// One request received by the fake store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateBucket { bucket: String },
    ListBuckets,
    DeleteBucket { bucket: String },
    Put { key: String, len: usize },
    Initiate { key: String },
    UploadPart { key: String, part_number: u32, len: usize },
    Complete { key: String, parts: Vec<u32> },
    Abort { key: String },
    Get { key: String },
    List { prefix: Option<String> },
    DeleteObject { key: String },
    DeleteObjects { count: usize },
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

/// A failure to inject `remaining` more times.
struct Injected {
    remaining: u32,
    error: StorageError,
}

#[derive(Default)]
struct StoreState {
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    calls: Vec<Call>,
    part_failures: HashMap<(String, u32), Injected>,
    put_failures: HashMap<String, Injected>,
    denied_deletes: HashSet<String>,
    list_failures: u32,
    continued_list_error: Option<StorageError>,
    late_arrivals: u32,
    next_late: u32,
    part_delay: Option<Duration>,
    key_delays: HashMap<String, Duration>,
}

/// Recording in-memory `StorageClient`.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    /// Create `bucket` holding `count` small objects named `obj-00000` onward.
    pub fn seed_bucket(&self, bucket: &str, count: usize) {
        let mut state = self.state();
        let objects = state.buckets.entry(bucket.to_string()).or_default();
        for i in 0..count {
            objects.insert(format!("obj-{:05}", i), vec![b'x'; 4]);
        }
    }

    pub fn insert_object(&self, bucket: &str, key: &str, data: &[u8]) {
        self.state()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.to_vec());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state().buckets.contains_key(bucket)
    }

    pub fn pending_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Fail uploads of `part_number` of `key` the next `times` times.
    pub fn fail_part(&self, key: &str, part_number: u32, times: u32, error: StorageError) {
        self.state().part_failures.insert(
            (key.to_string(), part_number),
            Injected {
                remaining: times,
                error,
            },
        );
    }

    /// Fail single-request uploads of `key` the next `times` times.
    pub fn fail_put(&self, key: &str, times: u32, error: StorageError) {
        self.state().put_failures.insert(
            key.to_string(),
            Injected {
                remaining: times,
                error,
            },
        );
    }

    /// Refuse every delete of `key`.
    pub fn deny_delete(&self, key: &str) {
        self.state().denied_deletes.insert(key.to_string());
    }

    /// Fail the next `times` listing requests with a transient error.
    pub fn fail_lists(&self, times: u32) {
        self.state().list_failures = times;
    }

    /// Fail every listing page after the first with `error`.
    pub fn fail_continued_lists(&self, error: StorageError) {
        self.state().continued_list_error = Some(error);
    }

    /// After each of the next `times` first-page listings, write a new
    /// `late-NN` key to the listed bucket, as a concurrent writer would.
    pub fn add_late_keys(&self, times: u32) {
        self.state().late_arrivals = times;
    }

    /// Delay every part upload and single put.
    pub fn set_part_delay(&self, delay: Duration) {
        self.state().part_delay = Some(delay);
    }

    /// Delay puts and part uploads of `key` only. Overrides `set_part_delay`.
    pub fn delay_key(&self, key: &str, delay: Duration) {
        self.state().key_delays.insert(key.to_string(), delay);
    }

    /// Highest number of concurrent put/part requests seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }

    fn take_failure<K: Hash + Eq>(
        failures: &mut HashMap<K, Injected>,
        id: &K,
    ) -> Option<StorageError> {
        let injected = failures.get_mut(id)?;
        if injected.remaining == 0 {
            return None;
        }
        injected.remaining -= 1;
        Some(injected.error.clone())
    }

    async fn enter_request(&self, key: &str) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        let delay: Option<Duration> = {
            let state = self.state();
            state.key_delays.get(key).copied().or(state.part_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        guard
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn etag_for(data: &[u8]) -> String {
    format!("\"etag-{}\"", data.len())
}

#[async_trait]
impl StorageClient for FakeStore {
    async fn create_bucket(&self, bucket: &str, _: Visibility) -> Result<(), StorageError> {
        let mut state = self.state();
        state.calls.push(Call::CreateBucket {
            bucket: bucket.to_string(),
        });
        state.buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let mut state = self.state();
        state.calls.push(Call::DeleteBucket {
            bucket: bucket.to_string(),
        });
        match state.buckets.get(bucket).map(BTreeMap::len) {
            None => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: String::new(),
            }),
            Some(len) if len > 0 => Err(StorageError::Service {
                code: "BucketNotEmpty".to_string(),
                message: format!("{} still holds {} objects", bucket, len),
            }),
            Some(_) => {
                state.buckets.remove(bucket);
                Ok(())
            }
        }
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        Ok(self.has_bucket(bucket))
    }

    async fn list_buckets(&self) -> Result<Vec<String>, StorageError> {
        let mut state = self.state();
        state.calls.push(Call::ListBuckets);
        Ok(state.buckets.keys().cloned().collect())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        _: Visibility,
    ) -> Result<String, StorageError> {
        self.record(Call::Put {
            key: key.to_string(),
            len: data.len(),
        });
        let _guard = self.enter_request(key).await;

        let mut state = self.state();
        if let Some(error) = Self::take_failure(&mut state.put_failures, &key.to_string()) {
            return Err(error);
        }
        state
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.to_vec());
        Ok(etag_for(data))
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        _: Visibility,
    ) -> Result<MultipartUpload, StorageError> {
        let mut state = self.state();
        state.calls.push(Call::Initiate {
            key: key.to_string(),
        });
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
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
        self.record(Call::UploadPart {
            key: upload.key.clone(),
            part_number,
            len: data.len(),
        });
        let _guard = self.enter_request(&upload.key).await;

        let mut state = self.state();
        let id = (upload.key.clone(), part_number);
        if let Some(error) = Self::take_failure(&mut state.part_failures, &id) {
            return Err(error);
        }
        let pending = state
            .uploads
            .get_mut(&upload.upload_id)
            .ok_or_else(|| StorageError::NotFound {
                bucket: upload.bucket.clone(),
                key: upload.key.clone(),
            })?;
        pending.parts.insert(part_number, data.to_vec());
        Ok(format!("\"part-{}\"", part_number))
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> Result<String, StorageError> {
        let mut state = self.state();
        state.calls.push(Call::Complete {
            key: upload.key.clone(),
            parts: parts.iter().map(|part| part.part_number).collect(),
        });
        let pending = state
            .uploads
            .remove(&upload.upload_id)
            .ok_or_else(|| StorageError::NotFound {
                bucket: upload.bucket.clone(),
                key: upload.key.clone(),
            })?;

        let mut body: Vec<u8> = Vec::new();
        for part in parts {
            let data = pending.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::Service {
                    code: "InvalidPart".to_string(),
                    message: format!("part {} was never uploaded", part.part_number),
                }
            })?;
            body.extend_from_slice(data);
        }
        let etag = etag_for(&body);
        state
            .buckets
            .entry(pending.bucket)
            .or_default()
            .insert(pending.key, body);
        Ok(etag)
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> Result<(), StorageError> {
        let mut state = self.state();
        state.calls.push(Call::Abort {
            key: upload.key.clone(),
        });
        state.uploads.remove(&upload.upload_id);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.record(Call::Get {
            key: key.to_string(),
        });
        self.object(bucket, key).ok_or_else(|| StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    async fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<u64, StorageError> {
        let data = self.get_object(bucket, key).await?;
        tokio::fs::write(file_path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, StorageError> {
        Ok(self.object(bucket, key).map(|data| ObjectInfo {
            key: key.to_string(),
            size: data.len() as u64,
            last_modified: None,
            etag: Some(etag_for(&data)),
        }))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: i32,
    ) -> Result<ListPage, StorageError> {
        let mut state = self.state();
        state.calls.push(Call::List {
            prefix: prefix.map(str::to_string),
        });
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(StorageError::transient("SlowDown"));
        }
        if let (Some(_), Some(error)) = (continuation_token, &state.continued_list_error) {
            return Err(error.clone());
        }
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: String::new(),
            })?;

        let mut matching = objects
            .iter()
            .filter(|(key, _)| prefix.map_or(true, |p| key.starts_with(p)))
            .filter(|(key, _)| continuation_token.map_or(true, |token| key.as_str() > token));
        let page: Vec<ObjectInfo> = matching
            .by_ref()
            .take(max_keys as usize)
            .map(|(key, data)| ObjectInfo {
                key: key.clone(),
                size: data.len() as u64,
                last_modified: None,
                etag: None,
            })
            .collect();
        let more: bool = matching.next().is_some();

        if continuation_token.is_none() && state.late_arrivals > 0 {
            state.late_arrivals -= 1;
            let late: String = format!("late-{:02}", state.next_late);
            state.next_late += 1;
            if let Some(objects) = state.buckets.get_mut(bucket) {
                objects.insert(late, vec![b'l'; 4]);
            }
        }

        Ok(ListPage {
            next_continuation_token: match (more, page.last()) {
                (true, Some(last)) => Some(last.key.clone()),
                _ => None,
            },
            objects: page,
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut state = self.state();
        state.calls.push(Call::DeleteObject {
            key: key.to_string(),
        });
        if state.denied_deletes.contains(key) {
            return Err(StorageError::AccessDenied {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "denied".to_string(),
            });
        }
        if let Some(objects) = state.buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> Result<DeleteOutput, StorageError> {
        let mut state = self.state();
        state.calls.push(Call::DeleteObjects { count: keys.len() });
        if keys.len() > 1000 {
            return Err(StorageError::validation("too many keys in one delete request"));
        }

        let mut output = DeleteOutput::default();
        for key in keys {
            if state.denied_deletes.contains(key) {
                output.failed.push(KeyFailure::new(
                    key.clone(),
                    StorageError::AccessDenied {
                        bucket: bucket.to_string(),
                        key: key.clone(),
                        message: "denied".to_string(),
                    },
                ));
                continue;
            }
            if let Some(objects) = state.buckets.get_mut(bucket) {
                objects.remove(key);
            }
            output.deleted.push(key.clone());
        }
        Ok(output)
    }

    async fn presign_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        Ok(format!(
            "https://{}.store.test/{}?expires={}",
            bucket,
            key,
            expires_in.as_secs()
        ))
    }
}

/// Route `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Retry policy with a 1 ms backoff so failure tests stay fast.
pub fn fast_retry() -> RetrySettings {
    RetrySettings::default().with_initial_backoff_ms(1)
}

/// Orchestrator over `store` with the given part size and pool size.
pub fn orchestrator(
    store: &Arc<FakeStore>,
    max_part_size: u64,
    pool_size: usize,
) -> TransferOrchestrator<FakeStore> {
    init_logging();
    let settings = OrchestratorSettings::default()
        .with_max_part_size(max_part_size)
        .with_pool_size(pool_size)
        .with_retry(fast_retry());
    TransferOrchestrator::new(Arc::clone(store), settings).unwrap()
}

pub fn purge_settings(batch_limit: usize, page_size: i32) -> PurgeSettings {
    init_logging();
    PurgeSettings::default()
        .with_batch_limit(batch_limit)
        .with_page_size(page_size)
        .with_retry(fast_retry())
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
