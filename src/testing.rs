//! Scripted fakes for the store, health probe, and remote API.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::model::{DailySummary, HydrationRecord, RecordId};
use crate::network::HealthProbe;
use crate::queue::{OfflineOperation, OpId};
use crate::remote::{CreateRecordRequest, HydrationApi, RemoteError, UpdateRecordRequest};
use crate::store::{FallbackStore, LocalStore, StoreError, StoreStats};
use crate::DEFAULT_DAILY_GOAL_ML;

#[must_use]
pub fn server_error() -> RemoteError {
    RemoteError::Http {
        status: 503,
        message: "Service unavailable".into(),
        error_code: None,
    }
}

#[must_use]
pub fn conflict_error() -> RemoteError {
    RemoteError::Http {
        status: 409,
        message: "Record was modified".into(),
        error_code: Some("CONFLICT".into()),
    }
}

#[must_use]
pub fn not_found_error() -> RemoteError {
    RemoteError::Http {
        status: 404,
        message: "Record not found".into(),
        error_code: None,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Store

/// In-memory store that can be told to fail every call.
#[derive(Debug, Default)]
pub struct FailableStore {
    inner: FallbackStore,
    should_fail: AtomicBool,
}

impl FailableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn inner(&self) -> &FallbackStore {
        &self.inner
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FailableStore {
    async fn put_record(&self, record: &HydrationRecord) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put_record(record).await
    }

    async fn put_records(&self, records: &[HydrationRecord]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put_records(records).await
    }

    async fn get_record(&self, id: &RecordId) -> Result<Option<HydrationRecord>, StoreError> {
        self.check()?;
        self.inner.get_record(id).await
    }

    async fn all_records(&self) -> Result<Vec<HydrationRecord>, StoreError> {
        self.check()?;
        self.inner.all_records().await
    }

    async fn records_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HydrationRecord>, StoreError> {
        self.check()?;
        self.inner.records_in_range(start, end).await
    }

    async fn delete_record(&self, id: &RecordId) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.delete_record(id).await
    }

    async fn enqueue(&self, op: &OfflineOperation) -> Result<(), StoreError> {
        self.check()?;
        self.inner.enqueue(op).await
    }

    async fn dequeue(&self, op_id: &OpId) -> Result<Option<OfflineOperation>, StoreError> {
        self.check()?;
        self.inner.dequeue(op_id).await
    }

    async fn dequeue_many(&self, op_ids: &[OpId]) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.dequeue_many(op_ids).await
    }

    async fn update_operation(&self, op: &OfflineOperation) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.update_operation(op).await
    }

    async fn queued_operations(&self) -> Result<Vec<OfflineOperation>, StoreError> {
        self.check()?;
        self.inner.queued_operations().await
    }

    async fn clear_queue(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.clear_queue().await
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set_setting(key, value).await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.check()?;
        self.inner.get_setting(key).await
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.clear_all().await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.check()?;
        self.inner.stats().await
    }
}

// ---------------------------------------------------------------------------
// Health probe

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    Ok,
    Fail,
    /// Never completes.
    Hang,
}

/// Replays a fixed list of probe outcomes, then repeats a default.
#[derive(Debug)]
pub struct ScriptedProbe {
    steps: Mutex<VecDeque<ProbeStep>>,
    fallback: ProbeStep,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    #[must_use]
    pub fn new(steps: Vec<ProbeStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: ProbeStep::Ok,
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn healthy() -> Self {
        Self::new(Vec::new())
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fallback: ProbeStep::Fail,
            ..Self::new(Vec::new())
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = lock(&self.steps).pop_front().unwrap_or(self.fallback);
        match step {
            ProbeStep::Ok => Ok(()),
            ProbeStep::Fail => Err(RemoteError::Network("probe failed".into())),
            ProbeStep::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Remote API

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Create { volume: u32 },
    Update { id: String, volume: Option<u32> },
    Delete { id: String },
    Get { id: String },
    Summary,
    Health,
}

/// In-memory server. Queued failures are consumed by create, update, and
/// delete calls in order; server ids are `srv-N`.
#[derive(Debug)]
pub struct ScriptedApi {
    calls: Mutex<Vec<ApiCall>>,
    failures: Mutex<VecDeque<RemoteError>>,
    records: Mutex<BTreeMap<String, HydrationRecord>>,
    next_id: AtomicU64,
    healthy: AtomicBool,
}

impl Default for ScriptedApi {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            records: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            healthy: AtomicBool::new(true),
        }
    }
}

impl ScriptedApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: RemoteError) {
        lock(&self.failures).push_back(error);
    }

    pub fn fail_times(&self, times: usize, error: RemoteError) {
        let mut failures = lock(&self.failures);
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn insert_remote(&self, record: HydrationRecord) {
        lock(&self.records).insert(record.id.to_string(), record);
    }

    #[must_use]
    pub fn remote_record(&self, id: &str) -> Option<HydrationRecord> {
        lock(&self.records).get(id).cloned()
    }

    #[must_use]
    pub fn remote_records(&self) -> Vec<HydrationRecord> {
        lock(&self.records).values().cloned().collect()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.calls).clone()
    }

    /// Number of create, update, and delete calls.
    #[must_use]
    pub fn mutation_calls(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    ApiCall::Create { .. } | ApiCall::Update { .. } | ApiCall::Delete { .. }
                )
            })
            .count()
    }

    fn record_call(&self, call: ApiCall) {
        lock(&self.calls).push(call);
    }

    fn take_failure(&self) -> Result<(), RemoteError> {
        match lock(&self.failures).pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HydrationApi for ScriptedApi {
    async fn create_record(
        &self,
        request: &CreateRecordRequest,
    ) -> Result<HydrationRecord, RemoteError> {
        self.record_call(ApiCall::Create {
            volume: request.volume,
        });
        self.take_failure()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = HydrationRecord {
            id: RecordId::new(format!("srv-{n}")),
            volume: request.volume,
            timestamp: request.recorded_at.unwrap_or_else(Utc::now),
            synced: true,
            local_id: None,
        };
        self.insert_remote(record.clone());
        Ok(record)
    }

    async fn update_record(
        &self,
        id: &RecordId,
        request: &UpdateRecordRequest,
    ) -> Result<HydrationRecord, RemoteError> {
        self.record_call(ApiCall::Update {
            id: id.to_string(),
            volume: request.volume,
        });
        self.take_failure()?;
        let mut records = lock(&self.records);
        let record = records.get_mut(id.as_str()).ok_or_else(not_found_error)?;
        if let Some(volume) = request.volume {
            record.volume = volume;
        }
        if let Some(ts) = request.recorded_at {
            record.timestamp = ts;
        }
        Ok(record.clone())
    }

    async fn delete_record(&self, id: &RecordId) -> Result<(), RemoteError> {
        self.record_call(ApiCall::Delete { id: id.to_string() });
        self.take_failure()?;
        lock(&self.records)
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(not_found_error)
    }

    async fn get_record(&self, id: &RecordId) -> Result<HydrationRecord, RemoteError> {
        self.record_call(ApiCall::Get { id: id.to_string() });
        self.remote_record(id.as_str()).ok_or_else(not_found_error)
    }

    async fn daily_summary(&self, date: Option<NaiveDate>) -> Result<DailySummary, RemoteError> {
        self.record_call(ApiCall::Summary);
        let day = date.unwrap_or_else(|| Utc::now().date_naive());
        Ok(DailySummary::compute(
            &self.remote_records(),
            day,
            &Utc,
            DEFAULT_DAILY_GOAL_ML,
        ))
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        self.record_call(ApiCall::Health);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Network("server unreachable".into()))
        }
    }
}

#[async_trait]
impl HealthProbe for ScriptedApi {
    async fn probe(&self) -> Result<(), RemoteError> {
        self.health_check().await
    }
}

