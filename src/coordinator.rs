//! Application state owner.
//!
//! Every write runs in two phases. Phase one mutates the in-memory state and
//! the local store and always happens. Phase two pushes the change to the
//! remote when online; if that cannot happen now the change goes to the
//! offline queue and is replayed by [`Coordinator::sync_offline_data`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{CoordinatorConfig, CoreConfig, SyncConfig};
use crate::error::{AppError, ErrorKind};
use crate::feedback::{ErrorInfo, ErrorReporter, FeedbackEvent, FeedbackHub};
use crate::model::{
    daily_total, DailySummary, HydrationRecord, LocalId, RecordId, RecordPatch, SyncStatus,
    UnixTimeMs,
};
use crate::network::{ListenerHandle, NetworkListener, NetworkMonitor};
use crate::queue::{partition_by_ceiling, OfflineOperation, OpId};
use crate::remote::{
    retry_with_backoff, CreateRecordRequest, HttpRemoteClient, HydrationApi,
    UpdateRecordRequest,
};
use crate::store::{open_store, LocalStore, StoreStats};
use crate::sync::{ConflictWinner, SyncEngine, SyncResult};
use crate::validation::{validate_daily_goal, validate_timestamp, validate_volume};
use crate::DAILY_GOAL_SETTING_KEY;

/// Read model for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HydrationState {
    pub daily_intake: u32,
    pub daily_goal: u32,
    pub records: Vec<HydrationRecord>,
    pub is_loading: bool,
    pub is_offline: bool,
    pub offline_queue: Vec<OfflineOperation>,
    pub sync_status: SyncStatus,
    pub last_updated: Option<DateTime<Utc>>,
}

impl HydrationState {
    fn new(daily_goal: u32, is_offline: bool) -> Self {
        Self {
            daily_intake: 0,
            daily_goal,
            records: Vec::new(),
            is_loading: false,
            is_offline,
            offline_queue: Vec::new(),
            sync_status: SyncStatus {
                is_online: !is_offline,
                ..SyncStatus::default()
            },
            last_updated: None,
        }
    }

    fn set_queue(&mut self, queue: Vec<OfflineOperation>) {
        self.sync_status.pending_count = queue.len();
        self.offline_queue = queue;
    }

    fn has_pending_for(&self, record: &HydrationRecord) -> bool {
        self.offline_queue.iter().any(|op| op.correlates_with(record))
    }

    fn recalculate(&mut self) -> u32 {
        self.daily_intake = daily_total(&self.records, Local::now().date_naive(), &Local);
        self.last_updated = Some(Utc::now());
        self.daily_intake
    }
}

/// Partial update of a record. Fields left `None` are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub volume: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemotePhase {
    /// Offline, or earlier changes to the record are still queued.
    Queued,
    /// The server accepted the change.
    Confirmed,
    /// The push failed with a retryable error and was queued.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub record_id: RecordId,
    /// Local copy after the write. `None` for deletes.
    pub record: Option<HydrationRecord>,
    pub phase: RemotePhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSkipReason {
    Offline,
    EmptyQueue,
    AlreadySyncing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub successful: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub evicted: usize,
    pub total_processed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Skipped(SyncSkipReason),
    Completed(SyncSummary),
    /// Results could not be applied locally. Also recorded in `sync_status.sync_error`.
    Failed(AppError),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(id: &RecordId) -> AppError {
    AppError::new(ErrorKind::NotFound, format!("Record {id} not found"))
        .with_context("record_id", id.to_string())
}

fn validate_update(update: &RecordUpdate, now: DateTime<Utc>) -> Result<RecordPatch, AppError> {
    let volume = update.volume.map(validate_volume).transpose()?;
    if let Some(ts) = update.timestamp {
        validate_timestamp(ts, now)?;
    }
    let patch = RecordPatch {
        volume,
        timestamp: update.timestamp,
    };
    if patch.is_empty() {
        return Err(AppError::new(
            ErrorKind::ValidationFailed,
            "Nothing to update",
        ));
    }
    Ok(patch)
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    sync_config: SyncConfig,
    store: Arc<dyn LocalStore>,
    network: NetworkMonitor,
    api: Arc<dyn HydrationApi>,
    engine: SyncEngine,
    state: Mutex<HydrationState>,
    /// Serialises every mutation of the durable queue.
    queue_lock: tokio::sync::Mutex<()>,
    feedback: FeedbackHub,
    reporter: ErrorReporter,
    listener: Mutex<Option<ListenerHandle>>,
    last_enqueue_ms: AtomicU64,
}

/// Clears `is_syncing` when the pass ends, however it ends.
struct SyncingGuard<'a> {
    state: &'a Mutex<HydrationState>,
}

impl<'a> SyncingGuard<'a> {
    fn acquire(state: &'a Mutex<HydrationState>) -> Option<Self> {
        let mut s = lock(state);
        if s.sync_status.is_syncing {
            return None;
        }
        s.sync_status.is_syncing = true;
        Some(Self { state })
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).sync_status.is_syncing = false;
    }
}

/// Keeps the offline flag current and syncs after reconnecting.
struct ReconnectListener {
    inner: Weak<CoordinatorInner>,
    settle: Duration,
}

impl ReconnectListener {
    fn set_offline(&self, offline: bool) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = lock(&inner.state);
            state.is_offline = offline;
            state.sync_status.is_online = !offline;
        }
    }
}

impl NetworkListener for ReconnectListener {
    fn on_online(&self) {
        self.set_offline(false);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, skipping reconnect sync");
            return;
        };
        let weak = self.inner.clone();
        let settle = self.settle;
        runtime.spawn(async move {
            tokio::time::sleep(settle).await;
            let Some(inner) = weak.upgrade() else { return };
            let coordinator = Coordinator { inner };
            match coordinator.sync_offline_data().await {
                SyncOutcome::Completed(summary) => {
                    debug!(?summary, "Reconnect sync finished");
                }
                SyncOutcome::Skipped(reason) => debug!(?reason, "Reconnect sync skipped"),
                SyncOutcome::Failed(err) => error!(error = %err, "Reconnect sync failed"),
            }
        });
    }

    fn on_offline(&self) {
        self.set_offline(true);
    }
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &*lock(&self.inner.state))
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Wires the coordinator to its collaborators and subscribes to network
    /// transitions.
    pub fn new(
        config: &CoreConfig,
        store: Arc<dyn LocalStore>,
        network: NetworkMonitor,
        api: Arc<dyn HydrationApi>,
    ) -> Self {
        let engine = SyncEngine::new(api.clone(), config.sync.clone(), config.retry.clone());
        let offline = !network.is_online();
        let inner = Arc::new(CoordinatorInner {
            config: config.coordinator.clone(),
            sync_config: config.sync.clone(),
            store,
            network: network.clone(),
            api,
            engine,
            state: Mutex::new(HydrationState::new(
                config.coordinator.default_daily_goal,
                offline,
            )),
            queue_lock: tokio::sync::Mutex::new(()),
            feedback: FeedbackHub::new(),
            reporter: ErrorReporter::new(),
            listener: Mutex::new(None),
            last_enqueue_ms: AtomicU64::new(0),
        });

        let handle = network.add_listener(Arc::new(ReconnectListener {
            inner: Arc::downgrade(&inner),
            settle: Duration::from_millis(config.sync.reconnect_settle_ms),
        }));
        *lock(&inner.listener) = Some(handle);

        Self { inner }
    }

    /// Builds the production stack: SQLite store with fallback, HTTP client,
    /// and a probing network monitor.
    pub fn from_config(config: &CoreConfig) -> Result<Self, AppError> {
        config.validate()?;
        let store = open_store(&config.store)?;
        let client = Arc::new(HttpRemoteClient::new(&config.remote)?);
        let network = NetworkMonitor::new(config.network.clone(), client.clone(), true);
        network.start();
        info!(base_url = %config.remote.base_url, "Hydration core started");
        Ok(Self::new(config, store, network, client))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HydrationState) -> R) -> R {
        f(&mut lock(&self.inner.state))
    }

    fn is_offline(&self) -> bool {
        !self.inner.network.is_online()
    }

    /// Monotonic enqueue stamp so operations issued in the same millisecond keep call order.
    fn next_enqueue_stamp(&self) -> UnixTimeMs {
        let now = UnixTimeMs::now().0;
        let previous = self
            .inner
            .last_enqueue_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        UnixTimeMs(now.max(previous.saturating_add(1)))
    }

    fn fail(&self, err: AppError, operation: &str) -> AppError {
        let mut context = HashMap::new();
        context.insert("operation".to_string(), operation.to_string());
        let info = self.inner.reporter.report(&err, context);
        self.inner.feedback.emit(FeedbackEvent::from_error(&info));
        err
    }

    fn notify_saved(&self, title: &str, detail: String, phase: RemotePhase) {
        let message = match phase {
            RemotePhase::Confirmed => detail,
            RemotePhase::Queued | RemotePhase::Deferred => format!("{detail} (offline mode)"),
        };
        self.inner
            .feedback
            .emit(FeedbackEvent::success(title, message));
    }

    /// Appends to the durable queue and the in-memory mirror. Caller holds `queue_lock`.
    async fn enqueue_locked(&self, op: OfflineOperation) -> Result<(), AppError> {
        self.inner.store.enqueue(&op).await?;
        debug!(op_id = %op.op_id, action = op.action().as_str(), "Operation queued");
        self.with_state(|s| {
            let mut queue = std::mem::take(&mut s.offline_queue);
            queue.push(op);
            s.set_queue(queue);
        });
        Ok(())
    }

    async fn defer(&self, op: OfflineOperation) -> Result<(), AppError> {
        let _queue = self.inner.queue_lock.lock().await;
        self.enqueue_locked(op).await
    }

    // -----------------------------------------------------------------------
    // Writes

    #[instrument(skip(self))]
    pub async fn add_intake(&self, volume: i64) -> Result<WriteOutcome, AppError> {
        let volume = validate_volume(volume).map_err(|e| self.fail(e.into(), "add_intake"))?;
        let record = HydrationRecord::new(volume, Utc::now());
        let offline = self.is_offline();

        {
            let _queue = self.inner.queue_lock.lock().await;
            self.with_state(|s| {
                s.records.push(record.clone());
                s.recalculate();
            });
            if offline {
                let op = OfflineOperation::create(record.clone(), self.next_enqueue_stamp());
                self.enqueue_locked(op)
                    .await
                    .map_err(|e| self.fail(e, "add_intake"))?;
            }
            self.inner
                .store
                .put_record(&record)
                .await
                .map_err(|e| self.fail(e.into(), "add_intake"))?;
        }

        let detail = format!("Added {volume} ml");
        if offline {
            self.notify_saved("Intake added", detail, RemotePhase::Queued);
            return Ok(WriteOutcome {
                record_id: record.id.clone(),
                record: Some(record),
                phase: RemotePhase::Queued,
            });
        }

        let request = CreateRecordRequest::from(&record);
        let api = &self.inner.api;
        let pushed = retry_with_backoff(&self.inner.config.write_retry, "create_record", || {
            api.create_record(&request)
        })
        .await;

        match pushed {
            Ok(remote) => {
                let adopted = self.adopt_server_id(&record.id, &remote.id).await?;
                self.notify_saved("Intake added", detail, RemotePhase::Confirmed);
                Ok(WriteOutcome {
                    record_id: remote.id,
                    record: adopted,
                    phase: RemotePhase::Confirmed,
                })
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Create deferred to offline queue");
                let op = OfflineOperation::create(record.clone(), self.next_enqueue_stamp());
                self.defer(op).await.map_err(|e| self.fail(e, "add_intake"))?;
                self.notify_saved("Intake added", detail, RemotePhase::Deferred);
                Ok(WriteOutcome {
                    record_id: record.id.clone(),
                    record: Some(record),
                    phase: RemotePhase::Deferred,
                })
            }
            Err(e) => Err(self.fail(e.into(), "add_intake")),
        }
    }

    /// Renames a confirmed record to its server id and marks it synced.
    async fn adopt_server_id(
        &self,
        client_id: &RecordId,
        server_id: &RecordId,
    ) -> Result<Option<HydrationRecord>, AppError> {
        let adopted = self.with_state(|s| {
            let record = s.records.iter_mut().find(|r| &r.id == client_id)?;
            if record.id != *server_id {
                if record.local_id.is_none() {
                    record.local_id = Some(LocalId::from(&record.id));
                }
                record.id = server_id.clone();
            }
            record.synced = true;
            Some(record.clone())
        });

        if let Some(record) = &adopted {
            if client_id != server_id {
                self.inner.store.delete_record(client_id).await?;
            }
            self.inner.store.put_record(record).await?;
        }
        Ok(adopted)
    }

    async fn mark_synced(&self, id: &RecordId) -> Result<Option<HydrationRecord>, AppError> {
        let updated = self.with_state(|s| {
            let pending = s
                .records
                .iter()
                .find(|r| &r.id == id)
                .is_some_and(|r| s.has_pending_for(r));
            let record = s.records.iter_mut().find(|r| &r.id == id)?;
            record.synced = !pending;
            Some(record.clone())
        });
        if let Some(record) = &updated {
            self.inner.store.put_record(record).await?;
        }
        Ok(updated)
    }

    #[instrument(skip(self, update), fields(record_id = %id))]
    pub async fn update_record(
        &self,
        id: &RecordId,
        update: RecordUpdate,
    ) -> Result<WriteOutcome, AppError> {
        let patch = validate_update(&update, Utc::now()).map_err(|e| self.fail(e, "update_record"))?;
        let offline = self.is_offline();

        let (record, queued) = {
            let _queue = self.inner.queue_lock.lock().await;
            let updated = self.with_state(|s| {
                let record = s.records.iter_mut().find(|r| &r.id == id)?;
                record.apply_patch(&patch);
                record.synced = false;
                let record = record.clone();
                s.recalculate();
                let queued = offline || s.has_pending_for(&record);
                Some((record, queued))
            });
            let Some((record, queued)) = updated else {
                return Err(self.fail(not_found(id), "update_record"));
            };

            if queued {
                let op =
                    OfflineOperation::update(&record, patch.clone(), self.next_enqueue_stamp());
                self.enqueue_locked(op)
                    .await
                    .map_err(|e| self.fail(e, "update_record"))?;
            }
            self.inner
                .store
                .put_record(&record)
                .await
                .map_err(|e| self.fail(e.into(), "update_record"))?;
            (record, queued)
        };

        let detail = format!("Updated to {} ml", record.volume);
        if queued {
            self.notify_saved("Record updated", detail, RemotePhase::Queued);
            return Ok(WriteOutcome {
                record_id: record.id.clone(),
                record: Some(record),
                phase: RemotePhase::Queued,
            });
        }

        let request = UpdateRecordRequest::from(&patch);
        let api = &self.inner.api;
        let pushed = retry_with_backoff(&self.inner.config.write_retry, "update_record", || {
            api.update_record(&record.id, &request)
        })
        .await;

        match pushed {
            Ok(_) => {
                let synced = self
                    .mark_synced(&record.id)
                    .await
                    .map_err(|e| self.fail(e, "update_record"))?;
                self.notify_saved("Record updated", detail, RemotePhase::Confirmed);
                Ok(WriteOutcome {
                    record_id: record.id.clone(),
                    record: synced,
                    phase: RemotePhase::Confirmed,
                })
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Update deferred to offline queue");
                let op = OfflineOperation::update(&record, patch, self.next_enqueue_stamp());
                self.defer(op).await.map_err(|e| self.fail(e, "update_record"))?;
                self.notify_saved("Record updated", detail, RemotePhase::Deferred);
                Ok(WriteOutcome {
                    record_id: record.id.clone(),
                    record: Some(record),
                    phase: RemotePhase::Deferred,
                })
            }
            Err(e) => Err(self.fail(e.into(), "update_record")),
        }
    }

    #[instrument(skip(self), fields(record_id = %id))]
    pub async fn delete_record(&self, id: &RecordId) -> Result<WriteOutcome, AppError> {
        let offline = self.is_offline();

        let (record, queued) = {
            let _queue = self.inner.queue_lock.lock().await;
            let removed = self.with_state(|s| {
                let index = s.records.iter().position(|r| &r.id == id)?;
                let record = s.records.remove(index);
                s.recalculate();
                let queued = offline || s.has_pending_for(&record);
                Some((record, queued))
            });
            let Some((record, queued)) = removed else {
                return Err(self.fail(not_found(id), "delete_record"));
            };

            if queued {
                let op = OfflineOperation::delete(&record, self.next_enqueue_stamp());
                self.enqueue_locked(op)
                    .await
                    .map_err(|e| self.fail(e, "delete_record"))?;
            }
            self.inner
                .store
                .delete_record(id)
                .await
                .map_err(|e| self.fail(e.into(), "delete_record"))?;
            (record, queued)
        };

        let outcome = |phase| WriteOutcome {
            record_id: record.id.clone(),
            record: None,
            phase,
        };
        let detail = format!("Removed {} ml", record.volume);
        if queued {
            self.notify_saved("Record deleted", detail, RemotePhase::Queued);
            return Ok(outcome(RemotePhase::Queued));
        }

        let api = &self.inner.api;
        let pushed = retry_with_backoff(&self.inner.config.write_retry, "delete_record", || {
            api.delete_record(&record.id)
        })
        .await;

        match pushed {
            Ok(()) => {
                self.notify_saved("Record deleted", detail, RemotePhase::Confirmed);
                Ok(outcome(RemotePhase::Confirmed))
            }
            Err(e) if e.is_not_found() => {
                debug!("Record already absent on server");
                self.notify_saved("Record deleted", detail, RemotePhase::Confirmed);
                Ok(outcome(RemotePhase::Confirmed))
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Delete deferred to offline queue");
                let op = OfflineOperation::delete(&record, self.next_enqueue_stamp());
                self.defer(op).await.map_err(|e| self.fail(e, "delete_record"))?;
                self.notify_saved("Record deleted", detail, RemotePhase::Deferred);
                Ok(outcome(RemotePhase::Deferred))
            }
            Err(e) => Err(self.fail(e.into(), "delete_record")),
        }
    }

    // -----------------------------------------------------------------------
    // Sync

    /// Replays the offline queue. Never returns an error: per-operation
    /// failures stay in the queue, and a local failure is recorded in
    /// `sync_status.sync_error`.
    #[instrument(skip(self))]
    pub async fn sync_offline_data(&self) -> SyncOutcome {
        if self.is_offline() {
            debug!("Sync skipped while offline");
            return SyncOutcome::Skipped(SyncSkipReason::Offline);
        }
        let Some(_syncing) = SyncingGuard::acquire(&self.inner.state) else {
            debug!("Sync already in progress");
            return SyncOutcome::Skipped(SyncSkipReason::AlreadySyncing);
        };

        match self.run_sync().await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "Sync pass failed");
                self.with_state(|s| s.sync_status.sync_error = Some(err.message.clone()));
                SyncOutcome::Failed(self.fail(err, "sync_offline_data"))
            }
        }
    }

    async fn run_sync(&self) -> Result<SyncOutcome, AppError> {
        let ceiling = self.inner.sync_config.retry_ceiling;
        let (pending, evicted) = {
            let _queue = self.inner.queue_lock.lock().await;
            let queued = self.inner.store.queued_operations().await?;
            if queued.is_empty() {
                return Ok(SyncOutcome::Skipped(SyncSkipReason::EmptyQueue));
            }

            let (pending, evicted) = partition_by_ceiling(queued, ceiling);
            if !evicted.is_empty() {
                for op in &evicted {
                    warn!(
                        op_id = %op.op_id,
                        action = op.action().as_str(),
                        retry_count = op.retry_count,
                        "Evicting operation past retry ceiling"
                    );
                }
                let ids: Vec<OpId> = evicted.iter().map(|op| op.op_id.clone()).collect();
                self.inner.store.dequeue_many(&ids).await?;
            }
            (pending, evicted.len())
        };

        let result = if pending.is_empty() {
            SyncResult::default()
        } else {
            let quality = self.inner.network.quality();
            self.inner.engine.sync(pending, quality).await
        };

        self.apply_sync_result(&result).await?;

        let summary = SyncSummary {
            successful: result.successful.len(),
            failed: result.failed.len(),
            conflicts: result.conflicts.len(),
            evicted,
            total_processed: result.total_processed,
        };
        self.with_state(|s| {
            s.sync_status.last_sync_at = Some(Utc::now());
            s.sync_status.sync_error = None;
        });

        if summary.successful > 0 {
            self.inner.feedback.emit(FeedbackEvent::success(
                "Sync complete",
                format!("Synced {} offline change(s)", summary.successful),
            ));
        }
        if summary.failed > 0 {
            self.inner.feedback.emit(FeedbackEvent::from_error(&ErrorInfo::from_app_error(
                &AppError::new(
                    ErrorKind::SyncFailed,
                    format!("{} change(s) could not be synced", summary.failed),
                ),
                HashMap::new(),
            )));
        }

        info!(
            successful = summary.successful,
            failed = summary.failed,
            conflicts = summary.conflicts,
            evicted = summary.evicted,
            "Offline data synced"
        );
        Ok(SyncOutcome::Completed(summary))
    }

    /// Applies an engine result to the durable queue, records, and state.
    /// Applying the same result twice leaves the same state.
    pub async fn apply_sync_result(&self, result: &SyncResult) -> Result<(), AppError> {
        let store = &self.inner.store;
        let _queue = self.inner.queue_lock.lock().await;

        let done = result.successful_op_ids();
        if !done.is_empty() {
            store.dequeue_many(&done).await?;
        }
        for failed in &result.failed {
            store.update_operation(&failed.operation).await?;
        }

        let remaps: HashMap<RecordId, RecordId> = result.id_remaps().into_iter().collect();
        if !remaps.is_empty() {
            for mut op in store.queued_operations().await? {
                if let Some(server_id) = remaps.get(op.record_id()).cloned() {
                    op.retarget(&server_id);
                    store.update_operation(&op).await?;
                }
            }
        }

        let touched: HashSet<RecordId> = result
            .successful
            .iter()
            .map(|s| {
                let id = s.operation.record_id();
                remaps.get(id).cloned().unwrap_or_else(|| id.clone())
            })
            .collect();
        let remote_wins: HashMap<&RecordId, &HydrationRecord> = result
            .conflicts
            .iter()
            .filter(|c| c.winner == ConflictWinner::Remote)
            .map(|c| (&c.resolved_record.id, &c.resolved_record))
            .collect();

        let queue = store.queued_operations().await?;

        let (changed, renamed) = self.with_state(|s| {
            let mut changed = Vec::new();
            let mut renamed = Vec::new();
            for record in &mut s.records {
                let mut dirty = false;
                if let Some(server_id) = remaps.get(&record.id) {
                    if record.local_id.is_none() {
                        record.local_id = Some(LocalId::from(&record.id));
                    }
                    renamed.push(record.id.clone());
                    record.id = server_id.clone();
                    dirty = true;
                }
                if let Some(remote) = remote_wins.get(&record.id) {
                    record.volume = remote.volume;
                    record.timestamp = remote.timestamp;
                    dirty = true;
                }
                if !record.synced
                    && touched.contains(&record.id)
                    && !queue.iter().any(|op| op.correlates_with(record))
                {
                    record.synced = true;
                    dirty = true;
                }
                if dirty {
                    changed.push(record.clone());
                }
            }
            s.set_queue(queue);
            s.recalculate();
            (changed, renamed)
        });

        for old_id in &renamed {
            store.delete_record(old_id).await?;
        }
        if !changed.is_empty() {
            store.put_records(&changed).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Aggregates and settings

    /// Sum of today's volumes in the local time zone. Also refreshes `daily_intake`.
    pub fn calculate_daily_intake(&self) -> u32 {
        self.with_state(HydrationState::recalculate)
    }

    pub async fn set_daily_goal(&self, goal: u32) -> Result<(), AppError> {
        let goal = validate_daily_goal(goal).map_err(|e| self.fail(e.into(), "set_daily_goal"))?;
        self.with_state(|s| {
            s.daily_goal = goal;
            s.last_updated = Some(Utc::now());
        });
        self.inner
            .store
            .set_setting(DAILY_GOAL_SETTING_KEY, &serde_json::json!(goal))
            .await
            .map_err(|e| self.fail(e.into(), "set_daily_goal"))
    }

    #[must_use]
    pub fn daily_progress(&self) -> DailySummary {
        let state = lock(&self.inner.state);
        DailySummary::compute(
            &state.records,
            Local::now().date_naive(),
            &Local,
            state.daily_goal,
        )
    }

    /// Server-side summary for `date`, today when `None`.
    pub async fn remote_daily_summary(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<DailySummary, AppError> {
        self.inner
            .api
            .daily_summary(date)
            .await
            .map_err(|e| self.fail(e.into(), "remote_daily_summary"))
    }

    pub async fn records_by_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HydrationRecord>, AppError> {
        Ok(self.inner.store.records_in_range(start, end).await?)
    }

    pub async fn store_stats(&self) -> Result<StoreStats, AppError> {
        Ok(self.inner.store.stats().await?)
    }

    pub async fn today_records(&self) -> Result<Vec<HydrationRecord>, AppError> {
        Ok(crate::store::records_on_day(
            self.inner.store.as_ref(),
            Local::now().date_naive(),
            &Local,
        )
        .await?)
    }

    // -----------------------------------------------------------------------
    // Cache

    /// Restores records, goal, and queue from the local store.
    #[instrument(skip(self))]
    pub async fn load_from_cache(&self) -> Result<(), AppError> {
        self.with_state(|s| s.is_loading = true);

        let loaded = async {
            let records = self.inner.store.all_records().await?;
            let goal = self
                .inner
                .store
                .get_setting(DAILY_GOAL_SETTING_KEY)
                .await?
                .and_then(|v| v.as_u64())
                .and_then(|g| u32::try_from(g).ok());
            let queue = self.inner.store.queued_operations().await?;
            Ok::<_, AppError>((records, goal, queue))
        }
        .await;

        match loaded {
            Ok((records, goal, queue)) => {
                let (count, pending) = self.with_state(|s| {
                    s.records = records;
                    if let Some(goal) = goal {
                        s.daily_goal = goal;
                    }
                    s.set_queue(queue);
                    s.recalculate();
                    s.is_loading = false;
                    (s.records.len(), s.offline_queue.len())
                });
                info!(records = count, pending, "Loaded hydration data from cache");
                Ok(())
            }
            Err(e) => {
                self.with_state(|s| s.is_loading = false);
                Err(self.fail(e, "load_from_cache"))
            }
        }
    }

    pub async fn save_to_cache(&self) -> Result<(), AppError> {
        let (records, goal) = self.with_state(|s| (s.records.clone(), s.daily_goal));
        let saved = async {
            self.inner.store.put_records(&records).await?;
            self.inner
                .store
                .set_setting(DAILY_GOAL_SETTING_KEY, &serde_json::json!(goal))
                .await?;
            Ok::<_, AppError>(())
        }
        .await;
        saved.map_err(|e| self.fail(e, "save_to_cache"))
    }

    pub async fn clear_offline_queue(&self) -> Result<(), AppError> {
        let _queue = self.inner.queue_lock.lock().await;
        self.inner
            .store
            .clear_queue()
            .await
            .map_err(|e| self.fail(e.into(), "clear_offline_queue"))?;
        self.with_state(|s| s.set_queue(Vec::new()));
        info!("Offline queue cleared");
        Ok(())
    }

    /// Wipes the store and resets state to defaults.
    pub async fn clear_all(&self) -> Result<(), AppError> {
        let _queue = self.inner.queue_lock.lock().await;
        self.inner
            .store
            .clear_all()
            .await
            .map_err(|e| self.fail(e.into(), "clear_all"))?;
        let offline = self.is_offline();
        self.with_state(|s| {
            *s = HydrationState::new(self.inner.config.default_daily_goal, offline);
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors

    #[must_use]
    pub fn snapshot(&self) -> HydrationState {
        lock(&self.inner.state).clone()
    }

    #[must_use]
    pub fn sync_status(&self) -> SyncStatus {
        lock(&self.inner.state).sync_status.clone()
    }

    #[must_use]
    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub async fn check_connectivity(&self) -> bool {
        self.inner.network.check_connectivity().await
    }

    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.inner.network.wait_for_connection(timeout).await
    }

    #[must_use]
    pub fn subscribe_feedback(&self) -> tokio::sync::broadcast::Receiver<FeedbackEvent> {
        self.inner.feedback.subscribe()
    }

    #[must_use]
    pub fn errors(&self) -> &ErrorReporter {
        &self.inner.reporter
    }

    /// Unregisters the network listener and stops health probing.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.inner.listener).take() {
            handle.unsubscribe();
        }
        self.inner.network.shutdown();
        info!("Coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::feedback::FeedbackKind;
    use crate::queue::OperationAction;
    use crate::remote::{RemoteError, RetryConfig};
    use crate::store::FallbackStore;
    use crate::testing::{server_error, ScriptedApi, ScriptedProbe};

    struct Harness {
        coordinator: Coordinator,
        api: Arc<ScriptedApi>,
        store: Arc<FallbackStore>,
        network: NetworkMonitor,
    }

    fn config() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.retry.jitter = false;
        config.coordinator.write_retry = RetryConfig {
            max_retries: 2,
            jitter: false,
            ..RetryConfig::default()
        };
        config
    }

    fn detach_reconnect(h: &Harness) {
        if let Some(handle) = h.coordinator.inner.listener.lock().unwrap().take() {
            handle.unsubscribe();
        }
    }

    fn harness(online: bool) -> Harness {
        let api = Arc::new(ScriptedApi::new());
        let store = Arc::new(FallbackStore::new());
        let network = NetworkMonitor::new(
            NetworkConfig::default(),
            Arc::new(ScriptedProbe::healthy()),
            online,
        );
        let coordinator = Coordinator::new(&config(), store.clone(), network.clone(), api.clone());
        Harness {
            coordinator,
            api,
            store,
            network,
        }
    }

    #[tokio::test]
    async fn offline_intake_is_queued() {
        let h = harness(false);

        let outcome = h.coordinator.add_intake(250).await.unwrap();

        assert_eq!(outcome.phase, RemotePhase::Queued);
        let state = h.coordinator.snapshot();
        assert_eq!(state.records.len(), 1);
        assert!(!state.records[0].synced);
        assert_eq!(state.daily_intake, 250);
        assert_eq!(state.offline_queue.len(), 1);
        assert_eq!(state.offline_queue[0].retry_count, 0);
        assert_eq!(state.offline_queue[0].action(), OperationAction::Create);
        assert_eq!(state.sync_status.pending_count, 1);
        assert_eq!(h.store.queued_operations().await.unwrap().len(), 1);
        assert_eq!(h.store.all_records().await.unwrap().len(), 1);
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn online_intake_adopts_server_id() {
        let h = harness(true);

        let outcome = h.coordinator.add_intake(300).await.unwrap();

        assert_eq!(outcome.phase, RemotePhase::Confirmed);
        assert_eq!(outcome.record_id.as_str(), "srv-1");
        let state = h.coordinator.snapshot();
        assert!(state.records[0].synced);
        assert_eq!(state.records[0].id.as_str(), "srv-1");
        assert!(state.records[0].local_id.is_some());
        assert!(state.offline_queue.is_empty());

        let stored = h.store.all_records().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id.as_str(), "srv-1");
    }

    #[tokio::test]
    async fn invalid_volume_leaves_state_untouched() {
        let h = harness(false);
        let mut feedback = h.coordinator.subscribe_feedback();

        for volume in [0, -5, 5001] {
            let err = h.coordinator.add_intake(volume).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidVolume);
        }

        let state = h.coordinator.snapshot();
        assert!(state.records.is_empty());
        assert!(state.offline_queue.is_empty());
        assert_eq!(state.daily_intake, 0);
        assert_eq!(h.coordinator.errors().history().len(), 3);
        assert_eq!(feedback.recv().await.unwrap().kind, FeedbackKind::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_push_failure_defers_to_queue() {
        let h = harness(true);
        h.api.fail_times(10, server_error());

        let outcome = h.coordinator.add_intake(250).await.unwrap();

        assert_eq!(outcome.phase, RemotePhase::Deferred);
        let state = h.coordinator.snapshot();
        assert!(!state.records[0].synced);
        assert_eq!(state.offline_queue.len(), 1);
        // Initial attempt plus two retries
        assert_eq!(h.api.mutation_calls(), 3);
    }

    #[tokio::test]
    async fn terminal_push_failure_is_returned() {
        let h = harness(true);
        let mut feedback = h.coordinator.subscribe_feedback();
        h.api.fail_next(RemoteError::Http {
            status: 422,
            message: "Volume invalid".into(),
            error_code: None,
        });

        let err = h.coordinator.add_intake(250).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ValidationFailed);
        let state = h.coordinator.snapshot();
        assert_eq!(state.records.len(), 1);
        assert!(!state.records[0].synced);
        assert!(state.offline_queue.is_empty());
        assert_eq!(feedback.recv().await.unwrap().kind, FeedbackKind::Warning);
    }

    #[tokio::test]
    async fn update_and_delete_unknown_record_fail_not_found() {
        let h = harness(false);
        let missing = RecordId::new("nope");

        let err = h
            .coordinator
            .update_record(
                &missing,
                RecordUpdate {
                    volume: Some(100),
                    timestamp: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err = h.coordinator.delete_record(&missing).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn update_validates_fields_before_mutating() {
        let h = harness(false);
        let id = h.coordinator.add_intake(250).await.unwrap().record_id;

        let err = h
            .coordinator
            .update_record(
                &id,
                RecordUpdate {
                    volume: Some(9_000),
                    timestamp: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidVolume);

        let err = h
            .coordinator
            .update_record(
                &id,
                RecordUpdate {
                    volume: None,
                    timestamp: Some(Utc::now() + chrono::Duration::hours(1)),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTimestamp);

        let err = h
            .coordinator
            .update_record(&id, RecordUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailed);

        let state = h.coordinator.snapshot();
        assert_eq!(state.records[0].volume, 250);
        assert_eq!(state.offline_queue.len(), 1);
    }

    #[tokio::test]
    async fn offline_update_and_delete_are_queued_in_order() {
        let h = harness(false);
        let id = h.coordinator.add_intake(250).await.unwrap().record_id;

        h.coordinator
            .update_record(
                &id,
                RecordUpdate {
                    volume: Some(400),
                    timestamp: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(h.coordinator.snapshot().daily_intake, 400);

        h.coordinator.delete_record(&id).await.unwrap();

        let state = h.coordinator.snapshot();
        assert!(state.records.is_empty());
        assert_eq!(state.daily_intake, 0);
        let actions: Vec<OperationAction> = h
            .store
            .queued_operations()
            .await
            .unwrap()
            .iter()
            .map(OfflineOperation::action)
            .collect();
        assert_eq!(
            actions,
            vec![
                OperationAction::Create,
                OperationAction::Update,
                OperationAction::Delete
            ]
        );
        assert!(h.store.all_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn online_update_confirms() {
        let h = harness(true);
        let id = h.coordinator.add_intake(250).await.unwrap().record_id;

        let outcome = h
            .coordinator
            .update_record(
                &id,
                RecordUpdate {
                    volume: Some(500),
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.phase, RemotePhase::Confirmed);
        assert!(outcome.record.unwrap().synced);
        assert_eq!(h.api.remote_record("srv-1").unwrap().volume, 500);
    }

    #[tokio::test]
    async fn online_write_behind_queued_changes_is_queued() {
        let h = harness(false);
        let id = h.coordinator.add_intake(250).await.unwrap().record_id;
        // Go online without letting the reconnect sync run
        detach_reconnect(&h);
        h.network.set_platform_online(true);

        let outcome = h
            .coordinator
            .update_record(
                &id,
                RecordUpdate {
                    volume: Some(300),
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.phase, RemotePhase::Queued);
        assert_eq!(h.coordinator.snapshot().offline_queue.len(), 2);
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_syncs_queue_and_flips_synced() {
        let h = harness(false);
        h.coordinator.add_intake(250).await.unwrap();
        h.coordinator.add_intake(500).await.unwrap();

        h.network.set_platform_online(true);
        assert!(!h.coordinator.snapshot().is_offline);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let state = h.coordinator.snapshot();
        assert!(state.offline_queue.is_empty());
        assert_eq!(state.sync_status.pending_count, 0);
        assert!(state.sync_status.last_sync_at.is_some());
        assert!(state.records.iter().all(|r| r.synced));
        assert!(state.records.iter().all(|r| r.id.as_str().starts_with("srv-")));
        assert!(h.store.queued_operations().await.unwrap().is_empty());
        assert_eq!(h.api.remote_records().len(), 2);
    }

    #[tokio::test]
    async fn sync_skips_when_offline_or_empty() {
        let h = harness(false);
        h.coordinator.add_intake(250).await.unwrap();
        assert_eq!(
            h.coordinator.sync_offline_data().await,
            SyncOutcome::Skipped(SyncSkipReason::Offline)
        );

        let online = harness(true);
        assert_eq!(
            online.coordinator.sync_offline_data().await,
            SyncOutcome::Skipped(SyncSkipReason::EmptyQueue)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_sync_is_a_no_op() {
        let h = harness(false);
        h.coordinator.add_intake(250).await.unwrap();
        detach_reconnect(&h);
        h.network.set_platform_online(true);
        // First attempt fails so the first pass sleeps in backoff
        h.api.fail_next(server_error());

        let (first, second) = tokio::join!(
            h.coordinator.sync_offline_data(),
            h.coordinator.sync_offline_data()
        );

        assert!(matches!(first, SyncOutcome::Completed(s) if s.successful == 1));
        assert_eq!(second, SyncOutcome::Skipped(SyncSkipReason::AlreadySyncing));
        assert!(!h.coordinator.sync_status().is_syncing);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_operations_are_evicted_without_replay() {
        let h = harness(true);
        let record = HydrationRecord::new(250, Utc::now());
        let mut op = OfflineOperation::create(record, UnixTimeMs(1));
        op.retry_count = 5;
        h.store.enqueue(&op).await.unwrap();

        let outcome = h.coordinator.sync_offline_data().await;

        let SyncOutcome::Completed(summary) = outcome else {
            panic!("expected completed sync, got {outcome:?}");
        };
        assert_eq!(summary.evicted, 1);
        assert_eq!(summary.total_processed, 0);
        assert_eq!(summary.successful + summary.failed, 0);
        assert!(h.store.queued_operations().await.unwrap().is_empty());
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sync_bumps_retry_count_and_keeps_entry() {
        let h = harness(false);
        h.coordinator.add_intake(250).await.unwrap();
        detach_reconnect(&h);
        h.network.set_platform_online(true);
        h.api.fail_times(50, server_error());

        let outcome = h.coordinator.sync_offline_data().await;

        assert!(matches!(outcome, SyncOutcome::Completed(s) if s.failed == 1));
        let queue = h.store.queued_operations().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].retry_count, 1);
        let state = h.coordinator.snapshot();
        assert_eq!(state.offline_queue[0].retry_count, 1);
        assert!(state.sync_status.sync_error.is_none());
        assert!(!state.records[0].synced);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_delete_is_not_lost_when_its_create_fails() {
        let h = harness(false);
        let id = h.coordinator.add_intake(250).await.unwrap().record_id;
        h.coordinator.delete_record(&id).await.unwrap();
        detach_reconnect(&h);
        h.network.set_platform_online(true);
        h.api.fail_times(6, server_error());

        let first = h.coordinator.sync_offline_data().await;

        assert!(matches!(first, SyncOutcome::Completed(s) if s.successful == 0 && s.failed == 2));
        let queue = h.store.queued_operations().await.unwrap();
        let actions: Vec<_> = queue.iter().map(OfflineOperation::action).collect();
        assert_eq!(actions, vec![OperationAction::Create, OperationAction::Delete]);
        assert_eq!(queue[1].retry_count, 0);

        let second = h.coordinator.sync_offline_data().await;

        assert!(matches!(second, SyncOutcome::Completed(s) if s.successful == 2));
        assert!(h.store.queued_operations().await.unwrap().is_empty());
        assert!(h.coordinator.snapshot().records.is_empty());
        assert!(h.api.remote_records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn write_during_sync_survives_for_next_pass() {
        let h = harness(false);
        h.coordinator.add_intake(250).await.unwrap();
        detach_reconnect(&h);
        h.network.set_platform_online(true);
        // First attempt fails so the pass sleeps in backoff
        h.api.fail_next(server_error());

        let write_mid_sync = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.network.set_platform_online(false);
            let outcome = h.coordinator.add_intake(400).await.unwrap();
            h.network.set_platform_online(true);
            outcome
        };
        let (first, written) = tokio::join!(h.coordinator.sync_offline_data(), write_mid_sync);

        assert_eq!(written.phase, RemotePhase::Queued);
        assert!(matches!(first, SyncOutcome::Completed(s) if s.successful == 1));
        let queue = h.store.queued_operations().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue[0].correlates_with(written.record.as_ref().unwrap()));
        assert_eq!(h.coordinator.snapshot().offline_queue.len(), 1);

        let second = h.coordinator.sync_offline_data().await;

        assert!(matches!(second, SyncOutcome::Completed(s) if s.successful == 1));
        assert!(h.store.queued_operations().await.unwrap().is_empty());
        assert_eq!(h.api.remote_records().len(), 2);
        assert!(h.coordinator.snapshot().records.iter().all(|r| r.synced));
    }

    #[tokio::test(start_paused = true)]
    async fn applying_a_result_twice_is_idempotent() {
        let h = harness(false);
        h.coordinator.add_intake(250).await.unwrap();
        h.coordinator.add_intake(100).await.unwrap();
        detach_reconnect(&h);
        h.network.set_platform_online(true);

        let queued = h.store.queued_operations().await.unwrap();
        let result = h
            .coordinator
            .inner
            .engine
            .sync(queued, h.network.quality())
            .await;

        h.coordinator.apply_sync_result(&result).await.unwrap();
        let once = h.coordinator.snapshot();
        h.coordinator.apply_sync_result(&result).await.unwrap();
        let twice = h.coordinator.snapshot();

        assert_eq!(once.records, twice.records);
        assert_eq!(once.offline_queue, twice.offline_queue);
        assert!(twice.offline_queue.is_empty());
        assert_eq!(h.store.all_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn daily_goal_persists_and_reloads() {
        let h = harness(false);
        h.coordinator.add_intake(500).await.unwrap();
        h.coordinator.set_daily_goal(2_500).await.unwrap();
        assert!(h.coordinator.set_daily_goal(0).await.is_err());

        let progress = h.coordinator.daily_progress();
        assert_eq!(progress.total_volume, 500);
        assert_eq!(progress.goal_volume, 2_500);
        assert!((progress.completion_rate - 20.0).abs() < 1e-6);

        let network = NetworkMonitor::new(
            NetworkConfig::default(),
            Arc::new(ScriptedProbe::healthy()),
            false,
        );
        let reloaded = Coordinator::new(&config(), h.store.clone(), network, h.api.clone());
        reloaded.load_from_cache().await.unwrap();

        let state = reloaded.snapshot();
        assert_eq!(state.daily_goal, 2_500);
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.daily_intake, 500);
        assert_eq!(state.sync_status.pending_count, 1);
        assert!(!state.is_loading);

        let stats = reloaded.store_stats().await.unwrap();
        assert_eq!(stats.total_records, 1);
        assert_eq!(stats.unsynced_records, 1);
        assert_eq!(stats.settings, 1);
        assert_eq!(reloaded.today_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_queue_and_clear_all() {
        let h = harness(false);
        h.coordinator.add_intake(250).await.unwrap();

        h.coordinator.clear_offline_queue().await.unwrap();
        assert!(h.coordinator.snapshot().offline_queue.is_empty());
        assert_eq!(h.coordinator.snapshot().records.len(), 1);

        h.coordinator.clear_all().await.unwrap();
        let state = h.coordinator.snapshot();
        assert!(state.records.is_empty());
        assert_eq!(state.daily_goal, crate::DEFAULT_DAILY_GOAL_ML);
        assert!(h.store.all_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_unregisters_listener() {
        let h = harness(true);
        assert_eq!(h.network.listener_count(), 1);

        h.coordinator.shutdown();

        assert_eq!(h.network.listener_count(), 0);
    }
}
