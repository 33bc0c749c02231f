//! Replays the offline queue against the remote API.
//!
//! The engine never touches durable storage. It returns a [`SyncResult`] that
//! the coordinator applies to the store and in-memory state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{AppError, ErrorKind};
use crate::model::{HydrationRecord, RecordId, RecordPatch};
use crate::network::NetworkQuality;
use crate::queue::{sort_by_enqueue_time, OfflineOperation, OpId, OperationPayload};
use crate::remote::{
    retry_with_backoff, CreateRecordRequest, HydrationApi, RemoteError, RetryConfig,
    UpdateRecordRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDecision {
    pub winner: ConflictWinner,
    pub reason: &'static str,
}

/// Timestamp-priority resolution: later timestamp wins, then larger volume,
/// and full equality keeps the local version.
#[must_use]
pub fn resolve_conflict(local: &HydrationRecord, remote: &HydrationRecord) -> ConflictDecision {
    if local.timestamp > remote.timestamp {
        ConflictDecision {
            winner: ConflictWinner::Local,
            reason: "local timestamp is newer",
        }
    } else if remote.timestamp > local.timestamp {
        ConflictDecision {
            winner: ConflictWinner::Remote,
            reason: "remote timestamp is newer",
        }
    } else if remote.volume > local.volume {
        ConflictDecision {
            winner: ConflictWinner::Remote,
            reason: "same timestamp, remote volume is larger",
        }
    } else if local.volume > remote.volume {
        ConflictDecision {
            winner: ConflictWinner::Local,
            reason: "same timestamp, local volume is larger",
        }
    } else {
        ConflictDecision {
            winner: ConflictWinner::Local,
            reason: "records are identical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub op_id: OpId,
    pub winner: ConflictWinner,
    pub resolved_record: HydrationRecord,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedOperation {
    pub operation: OfflineOperation,
    /// Server copy after the write, absent for deletes.
    pub remote_record: Option<HydrationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedOperation {
    /// The operation with `retry_count` already incremented, or unchanged
    /// when it was held behind an earlier failure and never sent.
    pub operation: OfflineOperation,
    pub error: AppError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub successful: Vec<SyncedOperation>,
    pub failed: Vec<FailedOperation>,
    pub conflicts: Vec<ConflictResolution>,
    pub total_processed: usize,
}

impl SyncResult {
    #[must_use]
    pub fn successful_op_ids(&self) -> Vec<OpId> {
        self.successful
            .iter()
            .map(|s| s.operation.op_id.clone())
            .collect()
    }

    /// Client id to server id for every create the server stored under a new id.
    #[must_use]
    pub fn id_remaps(&self) -> Vec<(RecordId, RecordId)> {
        self.successful
            .iter()
            .filter_map(|s| match (&s.operation.payload, &s.remote_record) {
                (OperationPayload::Create(local), Some(remote)) if local.id != remote.id => {
                    Some((local.id.clone(), remote.id.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn merge(&mut self, other: SyncResult) {
        self.successful.extend(other.successful);
        self.failed.extend(other.failed);
        self.conflicts.extend(other.conflicts);
        self.total_processed += other.total_processed;
    }
}

/// Parameters for one sync pass, derived from network quality.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub quality: NetworkQuality,
    pub retry: RetryConfig,
    pub batch_threshold: usize,
    pub batch_size: usize,
    pub inter_batch_pause: Option<Duration>,
}

enum Outcome {
    Synced(Option<HydrationRecord>),
    Failed(AppError),
}

/// What the client holds for a conflicting write.
enum LocalSide<'a> {
    Record(&'a HydrationRecord),
    Patch(&'a RecordPatch),
}

struct OperationReport {
    outcome: Outcome,
    conflict: Option<ConflictResolution>,
}

impl OperationReport {
    fn plain(outcome: Outcome) -> Self {
        Self {
            outcome,
            conflict: None,
        }
    }
}

fn failure_error(e: RemoteError) -> AppError {
    if e.is_retryable() {
        AppError::new(ErrorKind::RetryExhausted, "Retries exhausted")
            .with_internal(e.to_string())
            .with_context("remote_code", e.code())
    } else {
        AppError::from(e)
    }
}

pub struct SyncEngine {
    api: Arc<dyn HydrationApi>,
    config: SyncConfig,
    base_retry: RetryConfig,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn HydrationApi>, config: SyncConfig, base_retry: RetryConfig) -> Self {
        Self {
            api,
            config,
            base_retry,
        }
    }

    #[must_use]
    pub fn plan_for(&self, quality: NetworkQuality) -> SyncPlan {
        let base = &self.base_retry;
        let retry = match quality {
            NetworkQuality::Excellent => RetryConfig {
                max_retries: 5,
                base_delay_ms: 500,
                ..base.clone()
            },
            NetworkQuality::Good => RetryConfig {
                max_retries: 4,
                base_delay_ms: 1_000,
                ..base.clone()
            },
            NetworkQuality::Fair => RetryConfig {
                max_retries: 3,
                base_delay_ms: 2_000,
                ..base.clone()
            },
            NetworkQuality::Poor => RetryConfig {
                max_retries: 2,
                base_delay_ms: 5_000,
                max_delay_ms: base.max_delay_ms.max(60_000),
                ..base.clone()
            },
            NetworkQuality::Unknown => base.clone(),
        };

        let batch_size = if quality == NetworkQuality::Poor {
            self.config.poor_batch_size
        } else {
            self.config.batch_size
        };
        let inter_batch_pause = matches!(quality, NetworkQuality::Fair | NetworkQuality::Poor)
            .then(|| Duration::from_millis(self.config.inter_batch_pause_ms));

        SyncPlan {
            quality,
            retry,
            batch_threshold: self.config.batch_threshold,
            batch_size: batch_size.max(1),
            inter_batch_pause,
        }
    }

    /// Replays `operations` oldest first with parameters tuned to `quality`.
    pub async fn sync(
        &self,
        operations: Vec<OfflineOperation>,
        quality: NetworkQuality,
    ) -> SyncResult {
        let plan = self.plan_for(quality);
        self.sync_with_plan(operations, &plan).await
    }

    #[instrument(skip_all, fields(operations = operations.len(), quality = plan.quality.as_str()))]
    pub async fn sync_with_plan(
        &self,
        mut operations: Vec<OfflineOperation>,
        plan: &SyncPlan,
    ) -> SyncResult {
        sort_by_enqueue_time(&mut operations);
        let mut remaps: HashMap<RecordId, RecordId> = HashMap::new();
        let mut blocked: HashSet<RecordId> = HashSet::new();
        let mut result = SyncResult::default();

        if operations.len() <= plan.batch_threshold {
            let batch = self
                .sync_batch(&operations, plan, &mut remaps, &mut blocked)
                .await;
            result.merge(batch);
        } else {
            let batches: Vec<&[OfflineOperation]> = operations.chunks(plan.batch_size).collect();
            let count = batches.len();
            info!(batches = count, batch_size = plan.batch_size, "Syncing in batches");

            for (index, batch) in batches.into_iter().enumerate() {
                let batch_result = self
                    .sync_batch(batch, plan, &mut remaps, &mut blocked)
                    .await;
                result.merge(batch_result);

                if index + 1 < count {
                    if let Some(pause) = plan.inter_batch_pause {
                        debug!(
                            pause_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
                            "Pausing between batches"
                        );
                        tokio::time::sleep(pause).await;
                    }
                }
            }
        }

        info!(
            total = result.total_processed,
            successful = result.successful.len(),
            failed = result.failed.len(),
            conflicts = result.conflicts.len(),
            "Sync pass finished"
        );
        result
    }

    /// Replays one batch. A record whose earlier operation failed in this pass
    /// is `blocked`: its later operations are held back untouched so they
    /// never overtake the failed one.
    async fn sync_batch(
        &self,
        batch: &[OfflineOperation],
        plan: &SyncPlan,
        remaps: &mut HashMap<RecordId, RecordId>,
        blocked: &mut HashSet<RecordId>,
    ) -> SyncResult {
        let mut result = SyncResult::default();

        for operation in batch {
            if blocked.contains(operation.record_id()) {
                debug!(
                    op_id = %operation.op_id,
                    action = operation.action().as_str(),
                    "Held behind an earlier failed operation"
                );
                result.failed.push(FailedOperation {
                    operation: operation.clone(),
                    error: AppError::new(
                        ErrorKind::SyncFailed,
                        "Waiting for an earlier change to this record",
                    )
                    .with_context("op_id", operation.op_id.to_string()),
                });
                result.total_processed += 1;
                continue;
            }

            let mut target = operation.clone();
            if let Some(server_id) = remaps.get(target.record_id()) {
                target.retarget(server_id);
            }

            let report = self.sync_operation(&target, plan).await;

            if let Some(conflict) = report.conflict {
                result.conflicts.push(conflict);
            }
            match report.outcome {
                Outcome::Synced(remote_record) => {
                    if let (OperationPayload::Create(local), Some(remote)) =
                        (&operation.payload, &remote_record)
                    {
                        if local.id != remote.id {
                            remaps.insert(local.id.clone(), remote.id.clone());
                        }
                    }
                    debug!(op_id = %operation.op_id, action = operation.action().as_str(), "Operation synced");
                    result.successful.push(SyncedOperation {
                        operation: operation.clone(),
                        remote_record,
                    });
                }
                Outcome::Failed(error) => {
                    blocked.insert(operation.record_id().clone());
                    warn!(
                        op_id = %operation.op_id,
                        action = operation.action().as_str(),
                        retry_count = operation.retry_count + 1,
                        error = %error,
                        "Operation failed to sync"
                    );
                    result.failed.push(FailedOperation {
                        operation: operation.clone().with_incremented_retry(),
                        error,
                    });
                }
            }
            result.total_processed += 1;
        }

        result
    }

    async fn dispatch(
        &self,
        operation: &OfflineOperation,
    ) -> Result<Option<HydrationRecord>, RemoteError> {
        match &operation.payload {
            OperationPayload::Create(record) => self
                .api
                .create_record(&CreateRecordRequest::from(record))
                .await
                .map(Some),
            OperationPayload::Update { id, patch } => self
                .api
                .update_record(id, &UpdateRecordRequest::from(patch))
                .await
                .map(Some),
            OperationPayload::Delete { id } => match self.api.delete_record(id).await {
                Ok(()) => Ok(None),
                // Already gone on the server
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    async fn sync_operation(&self, operation: &OfflineOperation, plan: &SyncPlan) -> OperationReport {
        let name = operation.action().as_str();
        match retry_with_backoff(&plan.retry, name, || self.dispatch(operation)).await {
            Ok(remote) => OperationReport::plain(Outcome::Synced(remote)),
            Err(e) if e.is_conflict() => self.handle_conflict(operation, e, plan).await,
            Err(e) => OperationReport::plain(Outcome::Failed(failure_error(e))),
        }
    }

    async fn handle_conflict(
        &self,
        operation: &OfflineOperation,
        conflict: RemoteError,
        plan: &SyncPlan,
    ) -> OperationReport {
        let local_side = match &operation.payload {
            OperationPayload::Create(record) => LocalSide::Record(record),
            OperationPayload::Update { patch, .. } => LocalSide::Patch(patch),
            OperationPayload::Delete { .. } => {
                return OperationReport::plain(Outcome::Failed(
                    AppError::new(
                        ErrorKind::ConflictResolutionFailed,
                        "Delete conflicted with a remote change",
                    )
                    .with_internal(conflict.to_string()),
                ));
            }
        };

        let remote = match self.api.get_record(operation.record_id()).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(op_id = %operation.op_id, error = %e, "Could not fetch remote record for conflict");
                return OperationReport::plain(Outcome::Failed(
                    AppError::new(
                        ErrorKind::ConflictResolutionFailed,
                        "Could not fetch remote record",
                    )
                    .with_internal(e.to_string()),
                ));
            }
        };

        let local = match local_side {
            LocalSide::Record(record) => record.clone(),
            LocalSide::Patch(patch) => {
                let mut merged = remote.clone();
                merged.apply_patch(patch);
                merged.synced = false;
                merged
            }
        };

        let decision = resolve_conflict(&local, &remote);
        info!(
            op_id = %operation.op_id,
            winner = ?decision.winner,
            reason = decision.reason,
            "Resolved sync conflict"
        );

        match decision.winner {
            ConflictWinner::Remote => OperationReport {
                outcome: Outcome::Synced(Some(remote.clone())),
                conflict: Some(ConflictResolution {
                    op_id: operation.op_id.clone(),
                    winner: ConflictWinner::Remote,
                    resolved_record: remote,
                    reason: decision.reason.to_string(),
                }),
            },
            ConflictWinner::Local => {
                let replay = plan.retry.single_retry();
                let outcome =
                    match retry_with_backoff(&replay, "conflict_replay", || self.dispatch(operation))
                        .await
                    {
                        Ok(remote) => Outcome::Synced(remote),
                        Err(e) => Outcome::Failed(
                            AppError::new(
                                ErrorKind::ConflictResolutionFailed,
                                "Replay of local version failed",
                            )
                            .with_internal(e.to_string()),
                        ),
                    };
                OperationReport {
                    outcome,
                    conflict: Some(ConflictResolution {
                        op_id: operation.op_id.clone(),
                        winner: ConflictWinner::Local,
                        resolved_record: local,
                        reason: decision.reason.to_string(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnixTimeMs;
    use crate::testing::{conflict_error, server_error, ApiCall, ScriptedApi};
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use proptest::prelude::*;

    fn record_at(volume: u32, ts: DateTime<Utc>) -> HydrationRecord {
        HydrationRecord::new(volume, ts)
    }

    fn engine(api: Arc<ScriptedApi>) -> SyncEngine {
        let retry = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        SyncEngine::new(api, SyncConfig::default(), retry)
    }

    #[test]
    fn conflict_rules() {
        let t = Utc::now();
        let later = t + ChronoDuration::seconds(1);

        assert_eq!(
            resolve_conflict(&record_at(100, later), &record_at(500, t)).winner,
            ConflictWinner::Local
        );
        assert_eq!(
            resolve_conflict(&record_at(500, t), &record_at(100, later)).winner,
            ConflictWinner::Remote
        );
        assert_eq!(
            resolve_conflict(&record_at(300, t), &record_at(200, t)).winner,
            ConflictWinner::Local
        );
        assert_eq!(
            resolve_conflict(&record_at(200, t), &record_at(300, t)).winner,
            ConflictWinner::Remote
        );
        assert_eq!(
            resolve_conflict(&record_at(200, t), &record_at(200, t)).winner,
            ConflictWinner::Local
        );
    }

    proptest! {
        #[test]
        fn conflict_resolution_is_total_and_antisymmetric(
            t1 in 0i64..1_000, t2 in 0i64..1_000, v1 in 1u32..5000, v2 in 1u32..5000
        ) {
            let base = Utc::now();
            let a = record_at(v1, base + ChronoDuration::seconds(t1));
            let b = record_at(v2, base + ChronoDuration::seconds(t2));
            let ab = resolve_conflict(&a, &b).winner;
            let ba = resolve_conflict(&b, &a).winner;
            if t1 != t2 || v1 != v2 {
                prop_assert_ne!(ab, ba);
            } else {
                prop_assert_eq!(ab, ConflictWinner::Local);
                prop_assert_eq!(ba, ConflictWinner::Local);
            }
        }
    }

    #[test]
    fn plan_scales_with_quality() {
        let e = engine(Arc::new(ScriptedApi::new()));

        let excellent = e.plan_for(NetworkQuality::Excellent);
        assert_eq!(excellent.retry.max_retries, 5);
        assert_eq!(excellent.retry.base_delay_ms, 500);
        assert_eq!(excellent.batch_size, 5);
        assert_eq!(excellent.inter_batch_pause, None);

        let poor = e.plan_for(NetworkQuality::Poor);
        assert_eq!(poor.retry.max_retries, 2);
        assert_eq!(poor.retry.base_delay_ms, 5_000);
        assert_eq!(poor.retry.max_delay_ms, 60_000);
        assert_eq!(poor.batch_size, 3);
        assert_eq!(poor.inter_batch_pause, Some(Duration::from_millis(2_000)));

        let fair = e.plan_for(NetworkQuality::Fair);
        assert_eq!(fair.batch_size, 5);
        assert!(fair.inter_batch_pause.is_some());

        let unknown = e.plan_for(NetworkQuality::Unknown);
        assert_eq!(unknown.retry.max_retries, 5);
        assert_eq!(unknown.retry.base_delay_ms, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn replays_in_enqueue_order() {
        let api = Arc::new(ScriptedApi::new());
        let now = Utc::now();
        let first = OfflineOperation::create(record_at(100, now), UnixTimeMs(10));
        let second = OfflineOperation::create(record_at(200, now), UnixTimeMs(20));
        let third = OfflineOperation::create(record_at(300, now), UnixTimeMs(30));

        let result = engine(api.clone())
            .sync(vec![third, first, second], NetworkQuality::Good)
            .await;

        assert_eq!(result.total_processed, 3);
        assert_eq!(result.successful.len(), 3);
        let volumes: Vec<u32> = api
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::Create { volume } => Some(volume),
                _ => None,
            })
            .collect();
        assert_eq!(volumes, vec![100, 200, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn later_ops_follow_server_id_of_earlier_create() {
        let api = Arc::new(ScriptedApi::new());
        let record = record_at(250, Utc::now());
        let create = OfflineOperation::create(record.clone(), UnixTimeMs(1));
        let update = OfflineOperation::update(
            &record,
            RecordPatch {
                volume: Some(300),
                timestamp: None,
            },
            UnixTimeMs(2),
        );

        let result = engine(api.clone())
            .sync(vec![create, update], NetworkQuality::Excellent)
            .await;

        assert_eq!(result.successful.len(), 2);
        let remaps = result.id_remaps();
        assert_eq!(remaps.len(), 1);
        assert_eq!(remaps[0].0, record.id);
        let server_id = remaps[0].1.clone();
        assert!(api.calls().contains(&ApiCall::Update {
            id: server_id.to_string(),
            volume: Some(300)
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_within_pass() {
        let api = Arc::new(ScriptedApi::new());
        api.fail_times(2, server_error());
        let op = OfflineOperation::create(record_at(250, Utc::now()), UnixTimeMs(1));

        let result = engine(api.clone()).sync(vec![op], NetworkQuality::Good).await;

        assert_eq!(result.successful.len(), 1);
        assert!(result.failed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_failure_with_incremented_count() {
        let api = Arc::new(ScriptedApi::new());
        api.fail_times(10, server_error());
        let mut op = OfflineOperation::create(record_at(250, Utc::now()), UnixTimeMs(1));
        op.retry_count = 2;

        let result = engine(api.clone()).sync(vec![op], NetworkQuality::Poor).await;

        assert!(result.successful.is_empty());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].operation.retry_count, 3);
        assert_eq!(result.failed[0].error.kind, ErrorKind::RetryExhausted);
        // Poor quality allows two retries
        assert_eq!(api.mutation_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_fails_without_retry() {
        let api = Arc::new(ScriptedApi::new());
        api.fail_next(RemoteError::Http {
            status: 422,
            message: "Volume invalid".into(),
            error_code: Some("VALIDATION".into()),
        });
        let op = OfflineOperation::create(record_at(250, Utc::now()), UnixTimeMs(1));

        let result = engine(api.clone()).sync(vec![op], NetworkQuality::Good).await;

        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].error.kind, ErrorKind::ValidationFailed);
        assert_eq!(api.mutation_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_remote_wins_counts_as_success() {
        let api = Arc::new(ScriptedApi::new());
        let now = Utc::now();
        let mut remote = record_at(500, now);
        remote.id = RecordId::new("srv-x");
        api.insert_remote(remote.clone());
        api.fail_next(conflict_error());

        let local = HydrationRecord {
            id: remote.id.clone(),
            volume: 250,
            timestamp: now - ChronoDuration::minutes(5),
            synced: false,
            local_id: None,
        };
        let op = OfflineOperation::update(
            &local,
            RecordPatch {
                volume: Some(250),
                timestamp: Some(local.timestamp),
            },
            UnixTimeMs(1),
        );

        let result = engine(api.clone()).sync(vec![op], NetworkQuality::Good).await;

        assert_eq!(result.successful.len(), 1);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].winner, ConflictWinner::Remote);
        assert_eq!(result.conflicts[0].resolved_record.volume, 500);
        assert_eq!(result.successful[0].remote_record.as_ref().unwrap().volume, 500);
        // Only the conflicting attempt, no replay
        assert_eq!(api.mutation_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_local_wins_replays_once() {
        let api = Arc::new(ScriptedApi::new());
        let now = Utc::now();
        let mut remote = record_at(500, now - ChronoDuration::minutes(10));
        remote.id = RecordId::new("srv-y");
        api.insert_remote(remote.clone());
        api.fail_next(conflict_error());

        let op = OfflineOperation::update(
            &remote,
            RecordPatch {
                volume: Some(200),
                timestamp: Some(now),
            },
            UnixTimeMs(1),
        );

        let result = engine(api.clone()).sync(vec![op], NetworkQuality::Good).await;

        assert_eq!(result.successful.len(), 1);
        assert_eq!(result.conflicts[0].winner, ConflictWinner::Local);
        assert_eq!(api.mutation_calls(), 2);
        assert_eq!(api.remote_record("srv-y").unwrap().volume, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_conflict_is_reported_failed() {
        let api = Arc::new(ScriptedApi::new());
        let mut remote = record_at(500, Utc::now());
        remote.id = RecordId::new("srv-z");
        api.insert_remote(remote.clone());
        api.fail_next(conflict_error());

        let op = OfflineOperation::delete(&remote, UnixTimeMs(1));
        let result = engine(api.clone()).sync(vec![op], NetworkQuality::Good).await;

        assert_eq!(result.failed.len(), 1);
        assert_eq!(
            result.failed[0].error.kind,
            ErrorKind::ConflictResolutionFailed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_missing_remote_record_succeeds() {
        let api = Arc::new(ScriptedApi::new());
        let op = OfflineOperation::delete(&record_at(100, Utc::now()), UnixTimeMs(1));

        let result = engine(api).sync(vec![op], NetworkQuality::Good).await;

        assert_eq!(result.successful.len(), 1);
        assert!(result.successful[0].remote_record.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_waits_for_failed_create_of_same_record() {
        let api = Arc::new(ScriptedApi::new());
        let record = record_at(250, Utc::now());
        let create = OfflineOperation::create(record.clone(), UnixTimeMs(1));
        let delete = OfflineOperation::delete(&record, UnixTimeMs(2));
        let e = engine(api.clone());
        // Unknown quality allows five retries, so six failures exhaust the create
        api.fail_times(6, server_error());

        let first = e.sync(vec![create, delete], NetworkQuality::Unknown).await;

        assert!(first.successful.is_empty());
        assert_eq!(first.failed.len(), 2);
        assert_eq!(first.failed[0].operation.retry_count, 1);
        assert_eq!(first.failed[1].operation.retry_count, 0);
        assert_eq!(first.failed[1].error.kind, ErrorKind::SyncFailed);
        assert!(!api.calls().iter().any(|c| matches!(c, ApiCall::Delete { .. })));

        let retry: Vec<_> = first.failed.into_iter().map(|f| f.operation).collect();
        let second = e.sync(retry, NetworkQuality::Unknown).await;

        assert_eq!(second.successful.len(), 2);
        assert!(api.remote_records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_records_are_not_held_back() {
        let api = Arc::new(ScriptedApi::new());
        let now = Utc::now();
        let failing = OfflineOperation::create(record_at(250, now), UnixTimeMs(1));
        let other = OfflineOperation::create(record_at(300, now), UnixTimeMs(2));
        api.fail_next(RemoteError::Http {
            status: 422,
            message: "Volume invalid".into(),
            error_code: None,
        });

        let result = engine(api.clone())
            .sync(vec![failing, other], NetworkQuality::Good)
            .await;

        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.successful.len(), 1);
        assert_eq!(api.remote_records()[0].volume, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn large_queue_under_poor_quality_is_batched_with_pauses() {
        let api = Arc::new(ScriptedApi::new());
        let now = Utc::now();
        let ops: Vec<_> = (0..12u32)
            .map(|i| OfflineOperation::create(record_at(100 + i, now), UnixTimeMs(u64::from(i))))
            .collect();

        let start = tokio::time::Instant::now();
        let result = engine(api.clone()).sync(ops, NetworkQuality::Poor).await;

        assert_eq!(result.total_processed, 12);
        assert_eq!(result.successful.len(), 12);
        // Four batches of three, three pauses between them
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(6_000));
        assert!(elapsed < Duration::from_millis(8_000));
    }

    #[tokio::test(start_paused = true)]
    async fn small_queue_is_not_paused() {
        let api = Arc::new(ScriptedApi::new());
        let ops: Vec<_> = (0..10u64)
            .map(|i| OfflineOperation::create(record_at(100, Utc::now()), UnixTimeMs(i)))
            .collect();

        let start = tokio::time::Instant::now();
        let result = engine(api).sync(ops, NetworkQuality::Poor).await;

        assert_eq!(result.total_processed, 10);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
