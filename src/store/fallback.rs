//! In-memory store used when the primary database is unavailable.
//!
//! Optionally mirrors its state to a snapshot file after every mutation. The
//! snapshot is a CBOR envelope with magic bytes, a schema version and a
//! blake3 checksum, written through a temp file and renamed into place.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{validate_setting_key, LocalStore, StoreError, StoreStats};
use crate::model::{HydrationRecord, RecordId};
use crate::queue::{OfflineOperation, OpId};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 50 * 1024 * 1024;
const MAX_RECORDS: usize = 100_000;
const MAX_QUEUE_ENTRIES: usize = 10_000;
const STORE_MAGIC: &[u8; 4] = b"FUST";

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct FallbackState {
    records: BTreeMap<String, HydrationRecord>,
    queue: Vec<OfflineOperation>,
    /// JSON-encoded values.
    settings: BTreeMap<String, String>,
}

impl FallbackState {
    fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload)?;

        let envelope = SnapshotEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)?;
        Ok(bytes)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let envelope: SnapshotEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }
        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }
        if envelope.schema_version == 0 {
            return Err(StoreError::UnknownSchema(0));
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        let state: FallbackState = ciborium::from_reader(&envelope.payload[..])?;
        if state.queue.len() > MAX_QUEUE_ENTRIES {
            return Err(StoreError::QuotaExceeded {
                what: "offline queue",
                count: state.queue.len(),
                max: MAX_QUEUE_ENTRIES,
            });
        }
        Ok(state)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct FallbackStore {
    state: Mutex<FallbackState>,
    snapshot_path: Option<PathBuf>,
}

impl FallbackStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the snapshot at `path` if present; later mutations rewrite it.
    ///
    /// An unreadable snapshot is discarded with a warning rather than failing.
    pub fn with_snapshot(path: PathBuf) -> Result<Self, StoreError> {
        let state = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => {
                warn!(path = %path.display(), "Empty fallback snapshot, starting fresh");
                FallbackState::default()
            }
            Ok(bytes) => match FallbackState::deserialize(&bytes) {
                Ok(state) => state,
                Err(e @ StoreError::FutureSchema { .. }) => return Err(e),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable fallback snapshot");
                    FallbackState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FallbackState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path),
        })
    }

    #[must_use]
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    fn read<T>(&self, f: impl FnOnce(&FallbackState) -> T) -> Result<T, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::LockFailed)?;
        Ok(f(&state))
    }

    /// Applies `f` to a copy of the state and commits it only if the snapshot
    /// write succeeds.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut FallbackState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::LockFailed)?;
        let Some(path) = &self.snapshot_path else {
            return f(&mut state);
        };

        let mut next = state.clone();
        let result = f(&mut next)?;
        let bytes = next.serialize()?;
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }
        write_atomically(path, &bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "Wrote fallback snapshot");
        *state = next;
        Ok(result)
    }
}

fn check_record_quota(state: &FallbackState, incoming: usize) -> Result<(), StoreError> {
    let count = state.records.len() + incoming;
    if count > MAX_RECORDS {
        return Err(StoreError::QuotaExceeded {
            what: "records",
            count,
            max: MAX_RECORDS,
        });
    }
    Ok(())
}

#[async_trait]
impl LocalStore for FallbackStore {
    async fn put_record(&self, record: &HydrationRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            if !state.records.contains_key(record.id.as_str()) {
                check_record_quota(state, 1)?;
            }
            state
                .records
                .insert(record.id.as_str().to_string(), record.clone());
            Ok(())
        })
    }

    async fn put_records(&self, records: &[HydrationRecord]) -> Result<(), StoreError> {
        self.mutate(|state| {
            let new = records
                .iter()
                .filter(|r| !state.records.contains_key(r.id.as_str()))
                .count();
            check_record_quota(state, new)?;
            for record in records {
                state
                    .records
                    .insert(record.id.as_str().to_string(), record.clone());
            }
            Ok(())
        })
    }

    async fn get_record(&self, id: &RecordId) -> Result<Option<HydrationRecord>, StoreError> {
        self.read(|state| state.records.get(id.as_str()).cloned())
    }

    async fn all_records(&self) -> Result<Vec<HydrationRecord>, StoreError> {
        self.read(|state| {
            let mut records: Vec<_> = state.records.values().cloned().collect();
            records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            records
        })
    }

    async fn records_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HydrationRecord>, StoreError> {
        let mut records = self.all_records().await?;
        records.retain(|r| r.timestamp >= start && r.timestamp < end);
        Ok(records)
    }

    async fn delete_record(&self, id: &RecordId) -> Result<bool, StoreError> {
        self.mutate(|state| Ok(state.records.remove(id.as_str()).is_some()))
    }

    async fn enqueue(&self, op: &OfflineOperation) -> Result<(), StoreError> {
        self.mutate(|state| {
            if let Some(existing) = state.queue.iter_mut().find(|e| e.op_id == op.op_id) {
                *existing = op.clone();
                return Ok(());
            }
            if state.queue.len() >= MAX_QUEUE_ENTRIES {
                return Err(StoreError::QuotaExceeded {
                    what: "offline queue",
                    count: state.queue.len() + 1,
                    max: MAX_QUEUE_ENTRIES,
                });
            }
            // Insert after every entry with enqueued_at <= op's to keep order stable.
            let position = state
                .queue
                .iter()
                .rposition(|e| e.enqueued_at <= op.enqueued_at)
                .map_or(0, |i| i + 1);
            state.queue.insert(position, op.clone());
            Ok(())
        })
    }

    async fn dequeue(&self, op_id: &OpId) -> Result<Option<OfflineOperation>, StoreError> {
        self.mutate(|state| {
            Ok(state
                .queue
                .iter()
                .position(|e| &e.op_id == op_id)
                .map(|i| state.queue.remove(i)))
        })
    }

    async fn dequeue_many(&self, op_ids: &[OpId]) -> Result<usize, StoreError> {
        self.mutate(|state| {
            let before = state.queue.len();
            state.queue.retain(|e| !op_ids.contains(&e.op_id));
            Ok(before - state.queue.len())
        })
    }

    async fn update_operation(&self, op: &OfflineOperation) -> Result<bool, StoreError> {
        self.mutate(|state| {
            match state.queue.iter_mut().find(|e| e.op_id == op.op_id) {
                Some(existing) => {
                    *existing = op.clone();
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    async fn queued_operations(&self) -> Result<Vec<OfflineOperation>, StoreError> {
        self.read(|state| state.queue.clone())
    }

    async fn clear_queue(&self) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.queue.clear();
            Ok(())
        })
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        validate_setting_key(key)?;
        let encoded = serde_json::to_string(value)?;
        self.mutate(|state| {
            state.settings.insert(key.to_string(), encoded);
            Ok(())
        })
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        validate_setting_key(key)?;
        let raw = self.read(|state| state.settings.get(key).cloned())?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.mutate(|state| {
            *state = FallbackState::default();
            Ok(())
        })
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.read(|state| StoreStats {
            total_records: state.records.len(),
            unsynced_records: state.records.values().filter(|r| !r.synced).count(),
            queued_operations: state.queue.len(),
            settings: state.settings.len(),
        })
    }
}
