use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{HydrationRecord, LocalId, RecordId, RecordPatch, UnixTimeMs};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Invalid operation id: {0}")]
    InvalidId(String),
    #[error("Duplicate operation id: {0}")]
    DuplicateOpId(String),
}

/// Validated operation identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OpId(String);

impl OpId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, QueueError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), QueueError> {
        if id.is_empty() {
            return Err(QueueError::InvalidId("OpId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(QueueError::InvalidId(format!(
                "OpId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(QueueError::InvalidId(
                "OpId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

impl TryFrom<String> for OpId {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OpId> for String {
    fn from(id: OpId) -> Self {
        id.0
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationAction {
    Create,
    Update,
    Delete,
}

impl OperationAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "lowercase")]
pub enum OperationPayload {
    Create(HydrationRecord),
    Update { id: RecordId, patch: RecordPatch },
    Delete { id: RecordId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineOperation {
    pub op_id: OpId,
    pub local_id: LocalId,
    #[serde(flatten)]
    pub payload: OperationPayload,
    pub enqueued_at: UnixTimeMs,
    pub retry_count: u32,
}

impl OfflineOperation {
    #[must_use]
    pub fn create(record: HydrationRecord, enqueued_at: UnixTimeMs) -> Self {
        Self {
            op_id: OpId::generate(),
            local_id: record.correlation_id(),
            payload: OperationPayload::Create(record),
            enqueued_at,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn update(
        record: &HydrationRecord,
        patch: RecordPatch,
        enqueued_at: UnixTimeMs,
    ) -> Self {
        Self {
            op_id: OpId::generate(),
            local_id: record.correlation_id(),
            payload: OperationPayload::Update {
                id: record.id.clone(),
                patch,
            },
            enqueued_at,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn delete(record: &HydrationRecord, enqueued_at: UnixTimeMs) -> Self {
        Self {
            op_id: OpId::generate(),
            local_id: record.correlation_id(),
            payload: OperationPayload::Delete {
                id: record.id.clone(),
            },
            enqueued_at,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn action(&self) -> OperationAction {
        match self.payload {
            OperationPayload::Create(_) => OperationAction::Create,
            OperationPayload::Update { .. } => OperationAction::Update,
            OperationPayload::Delete { .. } => OperationAction::Delete,
        }
    }

    /// Id of the record this operation targets.
    #[must_use]
    pub fn record_id(&self) -> &RecordId {
        match &self.payload {
            OperationPayload::Create(record) => &record.id,
            OperationPayload::Update { id, .. } | OperationPayload::Delete { id } => id,
        }
    }

    pub fn retarget(&mut self, new_id: &RecordId) {
        match &mut self.payload {
            OperationPayload::Create(record) => record.id = new_id.clone(),
            OperationPayload::Update { id, .. } | OperationPayload::Delete { id } => {
                *id = new_id.clone();
            }
        }
    }

    #[must_use]
    pub fn correlates_with(&self, record: &HydrationRecord) -> bool {
        self.local_id == record.correlation_id() || self.record_id() == &record.id
    }

    #[must_use]
    pub fn with_incremented_retry(mut self) -> Self {
        self.retry_count = self.retry_count.saturating_add(1);
        self
    }

    #[must_use]
    pub fn exceeds_ceiling(&self, ceiling: u32) -> bool {
        self.retry_count >= ceiling
    }
}

/// Stable sort by enqueue time, ties keep their existing order.
pub fn sort_by_enqueue_time(ops: &mut [OfflineOperation]) {
    ops.sort_by_key(|op| op.enqueued_at);
}

/// Splits operations into those still eligible for replay and those at or past the ceiling.
#[must_use]
pub fn partition_by_ceiling(
    ops: Vec<OfflineOperation>,
    ceiling: u32,
) -> (Vec<OfflineOperation>, Vec<OfflineOperation>) {
    ops.into_iter().partition(|op| !op.exceeds_ceiling(ceiling))
}

pub fn ensure_unique(
    queue: &[OfflineOperation],
    candidate: &OfflineOperation,
) -> Result<(), QueueError> {
    if queue.iter().any(|op| op.op_id == candidate.op_id) {
        return Err(QueueError::DuplicateOpId(candidate.op_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(volume: u32) -> HydrationRecord {
        HydrationRecord::new(volume, Utc::now())
    }

    #[test]
    fn op_id_validation() {
        assert!(OpId::new("abc-123_x").is_ok());
        assert_eq!(OpId::new("  padded  ").unwrap().as_str(), "padded");
        assert!(OpId::new("").is_err());
        assert!(OpId::new("has space").is_err());
        assert!(OpId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn op_id_rejects_invalid_on_deserialize() {
        let result: Result<OpId, _> = serde_json::from_str("\"bad id!\"");
        assert!(result.is_err());
    }

    #[test]
    fn serialized_shape_carries_action_and_data() {
        let op = OfflineOperation::delete(&record(250), UnixTimeMs(42));
        let json = serde_json::to_value(&op).unwrap();

        assert_eq!(json["action"], "delete");
        assert_eq!(json["data"]["id"], op.record_id().as_str());
        assert_eq!(json["enqueuedAt"], 42);
        assert_eq!(json["retryCount"], 0);

        let back: OfflineOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn action_follows_payload() {
        let r = record(300);
        assert_eq!(
            OfflineOperation::create(r.clone(), UnixTimeMs(1)).action(),
            OperationAction::Create
        );
        assert_eq!(
            OfflineOperation::update(&r, RecordPatch::default(), UnixTimeMs(1)).action(),
            OperationAction::Update
        );
        assert_eq!(
            OfflineOperation::delete(&r, UnixTimeMs(1)).action(),
            OperationAction::Delete
        );
    }

    #[test]
    fn sort_is_stable_for_equal_timestamps() {
        let r = record(100);
        let a = OfflineOperation::create(r.clone(), UnixTimeMs(5));
        let b = OfflineOperation::delete(&r, UnixTimeMs(5));
        let c = OfflineOperation::update(&r, RecordPatch::default(), UnixTimeMs(1));

        let mut ops = vec![a.clone(), b.clone(), c.clone()];
        sort_by_enqueue_time(&mut ops);

        assert_eq!(ops, vec![c, a, b]);
    }

    #[test]
    fn partition_splits_at_ceiling() {
        let r = record(100);
        let mut fresh = OfflineOperation::create(r.clone(), UnixTimeMs(1));
        fresh.retry_count = 4;
        let mut exhausted = OfflineOperation::delete(&r, UnixTimeMs(2));
        exhausted.retry_count = 5;

        let (keep, evict) = partition_by_ceiling(vec![fresh.clone(), exhausted.clone()], 5);

        assert_eq!(keep, vec![fresh]);
        assert_eq!(evict, vec![exhausted]);
    }

    #[test]
    fn retarget_rewrites_record_id() {
        let r = record(100);
        let mut op = OfflineOperation::update(&r, RecordPatch::default(), UnixTimeMs(1));
        op.retarget(&RecordId::new("srv-9"));
        assert_eq!(op.record_id().as_str(), "srv-9");
        assert_eq!(op.local_id, r.correlation_id());
    }

    #[test]
    fn duplicate_op_ids_rejected() {
        let op = OfflineOperation::create(record(100), UnixTimeMs(1));
        let queue = vec![op.clone()];
        assert!(matches!(
            ensure_unique(&queue, &op),
            Err(QueueError::DuplicateOpId(_))
        ));
    }

    #[test]
    fn retry_increment_saturates() {
        let mut op = OfflineOperation::create(record(100), UnixTimeMs(1));
        op.retry_count = u32::MAX;
        assert_eq!(op.with_incremented_retry().retry_count, u32::MAX);
    }
}
