//! Durable local storage for records, the offline queue and settings.

mod fallback;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use fallback::FallbackStore;
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteStore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::model::{HydrationRecord, RecordId};
use crate::queue::{OfflineOperation, OpId};

const MAX_SETTING_KEY_LENGTH: usize = 256;

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(not(target_arch = "wasm32"))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("quota exceeded: {what} has {count} entries, max {max}")]
    QuotaExceeded {
        what: &'static str,
        count: usize,
        max: usize,
    },

    #[error("invalid setting key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("lock acquisition failed")]
    LockFailed,
}

impl StoreError {
    /// The backend itself is failing, as opposed to a bad argument or row.
    #[must_use]
    pub fn is_availability_failure(&self) -> bool {
        match self {
            #[cfg(not(target_arch = "wasm32"))]
            StoreError::Sqlite(_) => true,
            StoreError::Io(_) | StoreError::Unavailable(_) | StoreError::LockFailed => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub(crate) fn validate_setting_key(key: &str) -> Result<(), StoreError> {
    let reason = if key.is_empty() {
        "cannot be empty"
    } else if key.len() > MAX_SETTING_KEY_LENGTH {
        "too long"
    } else if key.chars().any(char::is_control) {
        "contains control characters"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidKey {
        key: key.chars().take(64).collect(),
        reason,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_records: usize,
    pub unsynced_records: usize,
    pub queued_operations: usize,
    pub settings: usize,
}

/// Persistent storage for the hydration core.
///
/// Records are keyed by `RecordId`, queue entries by `OpId`. Queue reads
/// return entries in enqueue order.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn put_record(&self, record: &HydrationRecord) -> Result<(), StoreError>;
    async fn put_records(&self, records: &[HydrationRecord]) -> Result<(), StoreError>;
    async fn get_record(&self, id: &RecordId) -> Result<Option<HydrationRecord>, StoreError>;
    async fn all_records(&self) -> Result<Vec<HydrationRecord>, StoreError>;
    /// Records with `start <= timestamp < end`, oldest first.
    async fn records_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HydrationRecord>, StoreError>;
    async fn delete_record(&self, id: &RecordId) -> Result<bool, StoreError>;

    /// Inserts the operation, replacing any entry with the same `op_id`.
    async fn enqueue(&self, op: &OfflineOperation) -> Result<(), StoreError>;
    async fn dequeue(&self, op_id: &OpId) -> Result<Option<OfflineOperation>, StoreError>;
    /// Removes all listed entries atomically, ignoring ids not present.
    async fn dequeue_many(&self, op_ids: &[OpId]) -> Result<usize, StoreError>;
    /// Replaces an existing entry. Returns false when the entry is gone.
    async fn update_operation(&self, op: &OfflineOperation) -> Result<bool, StoreError>;
    async fn queued_operations(&self) -> Result<Vec<OfflineOperation>, StoreError>;
    async fn clear_queue(&self) -> Result<(), StoreError>;

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError>;
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Empties records, queue and settings in one step.
    async fn clear_all(&self) -> Result<(), StoreError>;
    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Records whose timestamp falls on `day` in `tz`.
pub async fn records_on_day<Tz: TimeZone>(
    store: &dyn LocalStore,
    day: NaiveDate,
    tz: &Tz,
) -> Result<Vec<HydrationRecord>, StoreError> {
    // Widen by a day on each side, then filter exactly in the target zone.
    let start = day
        .pred_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(DateTime::<Utc>::MIN_UTC, |n| n.and_utc());
    let end = day
        .succ_opt()
        .and_then(|d| d.succ_opt())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(DateTime::<Utc>::MAX_UTC, |n| n.and_utc());

    let mut records = store.records_in_range(start, end).await?;
    records.retain(|r| r.is_on_day(day, tz));
    Ok(records)
}

/// Primary store with an in-memory fallback.
///
/// The first primary availability failure flips the store into degraded mode
/// for the rest of the session; every later call goes to the fallback. Other
/// primary errors are returned as they are.
pub struct ResilientStore {
    primary: Option<Arc<dyn LocalStore>>,
    fallback: Arc<FallbackStore>,
    degraded: AtomicBool,
}

macro_rules! route {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        if let Some(primary) = $self.active_primary() {
            match primary.$method($($arg),*).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_availability_failure() => {
                    $self.degrade(stringify!($method), &e)
                }
                Err(e) => return Err(e),
            }
        }
        $self.fallback.$method($($arg),*).await
    }};
}

impl ResilientStore {
    pub fn new(primary: Arc<dyn LocalStore>, fallback: Arc<FallbackStore>) -> Self {
        Self {
            primary: Some(primary),
            fallback,
            degraded: AtomicBool::new(false),
        }
    }

    /// Store that runs on the fallback from the start.
    pub fn fallback_only(fallback: Arc<FallbackStore>) -> Self {
        Self {
            primary: None,
            fallback,
            degraded: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn active_primary(&self) -> Option<&Arc<dyn LocalStore>> {
        if self.is_degraded() {
            None
        } else {
            self.primary.as_ref()
        }
    }

    fn degrade(&self, operation: &str, error: &StoreError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(operation, error = %error, "Primary store failed, switching to fallback store");
        }
    }
}

#[async_trait]
impl LocalStore for ResilientStore {
    async fn put_record(&self, record: &HydrationRecord) -> Result<(), StoreError> {
        route!(self, put_record(record))
    }

    async fn put_records(&self, records: &[HydrationRecord]) -> Result<(), StoreError> {
        route!(self, put_records(records))
    }

    async fn get_record(&self, id: &RecordId) -> Result<Option<HydrationRecord>, StoreError> {
        route!(self, get_record(id))
    }

    async fn all_records(&self) -> Result<Vec<HydrationRecord>, StoreError> {
        route!(self, all_records())
    }

    async fn records_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HydrationRecord>, StoreError> {
        route!(self, records_in_range(start, end))
    }

    async fn delete_record(&self, id: &RecordId) -> Result<bool, StoreError> {
        route!(self, delete_record(id))
    }

    async fn enqueue(&self, op: &OfflineOperation) -> Result<(), StoreError> {
        route!(self, enqueue(op))
    }

    async fn dequeue(&self, op_id: &OpId) -> Result<Option<OfflineOperation>, StoreError> {
        route!(self, dequeue(op_id))
    }

    async fn dequeue_many(&self, op_ids: &[OpId]) -> Result<usize, StoreError> {
        route!(self, dequeue_many(op_ids))
    }

    async fn update_operation(&self, op: &OfflineOperation) -> Result<bool, StoreError> {
        route!(self, update_operation(op))
    }

    async fn queued_operations(&self) -> Result<Vec<OfflineOperation>, StoreError> {
        route!(self, queued_operations())
    }

    async fn clear_queue(&self) -> Result<(), StoreError> {
        route!(self, clear_queue())
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        route!(self, set_setting(key, value))
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        route!(self, get_setting(key))
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        route!(self, clear_all())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        route!(self, stats())
    }
}

/// Opens the configured primary store wrapped with a fallback.
///
/// A primary that cannot be opened is logged and the fallback is used directly.
pub fn open_store(config: &StoreConfig) -> Result<Arc<ResilientStore>, StoreError> {
    let fallback = Arc::new(match &config.fallback_snapshot_path {
        Some(path) => FallbackStore::with_snapshot(path.clone())?,
        None => FallbackStore::new(),
    });

    #[cfg(not(target_arch = "wasm32"))]
    {
        let opened = match &config.database_path {
            Some(path) => SqliteStore::open(path),
            None => SqliteStore::open_in_memory(),
        };
        match opened {
            Ok(primary) => {
                info!(path = ?config.database_path, "Opened sqlite store");
                return Ok(Arc::new(ResilientStore::new(Arc::new(primary), fallback)));
            }
            Err(e) => {
                warn!(error = %e, "Failed to open sqlite store, using fallback store");
            }
        }
    }

    Ok(Arc::new(ResilientStore::fallback_only(fallback)))
}
