//! SQLite-backed primary store.
//!
//! The connection lives behind a mutex and every call runs on the blocking
//! pool, so the async API never stalls the runtime on disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::{validate_setting_key, LocalStore, StoreError, StoreStats};
use crate::model::{HydrationRecord, LocalId, RecordId};
use crate::queue::{OfflineOperation, OpId};

const SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS hydration_records (
    id           TEXT PRIMARY KEY NOT NULL,
    volume       INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    synced       INTEGER NOT NULL,
    local_id     TEXT
);
CREATE INDEX IF NOT EXISTS idx_records_timestamp ON hydration_records(timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_records_synced ON hydration_records(synced);

CREATE TABLE IF NOT EXISTS offline_queue (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    op_id       TEXT NOT NULL UNIQUE,
    local_id    TEXT NOT NULL,
    action      TEXT NOT NULL,
    data        TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_order ON offline_queue(enqueued_at, seq);
CREATE INDEX IF NOT EXISTS idx_queue_action ON offline_queue(action);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: current,
            max: SCHEMA_VERSION,
        });
    }
    if current < 1 {
        info!("Applying store schema v1");
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }
    Ok(())
}

struct RecordRow {
    id: String,
    volume: u32,
    timestamp_ms: i64,
    synced: bool,
    local_id: Option<String>,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            volume: row.get(1)?,
            timestamp_ms: row.get(2)?,
            synced: row.get(3)?,
            local_id: row.get(4)?,
        })
    }

    fn into_record(self) -> Result<HydrationRecord, StoreError> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms).ok_or(
            StoreError::Corrupted {
                reason: "record timestamp out of range",
            },
        )?;
        Ok(HydrationRecord {
            id: RecordId::new(self.id),
            volume: self.volume,
            timestamp,
            synced: self.synced,
            local_id: self.local_id.map(LocalId::new),
        })
    }
}

const RECORD_COLUMNS: &str = "id, volume, timestamp_ms, synced, local_id";

fn upsert_record(conn: &Connection, record: &HydrationRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO hydration_records (id, volume, timestamp_ms, synced, local_id)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            volume = excluded.volume,
            timestamp_ms = excluded.timestamp_ms,
            synced = excluded.synced,
            local_id = excluded.local_id",
        params![
            record.id.as_str(),
            record.volume,
            record.timestamp.timestamp_millis(),
            record.synced,
            record.local_id.as_ref().map(LocalId::as_str),
        ],
    )?;
    Ok(())
}

fn query_records(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<HydrationRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, RecordRow::from_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

fn query_queue(conn: &Connection) -> Result<Vec<OfflineOperation>, StoreError> {
    let mut stmt = conn.prepare("SELECT data FROM offline_queue ORDER BY enqueued_at, seq")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut ops = Vec::new();
    for row in rows {
        ops.push(serde_json::from_str(&row?)?);
    }
    Ok(ops)
}

fn enqueued_at_sql(op: &OfflineOperation) -> i64 {
    i64::try_from(op.enqueued_at.0).unwrap_or(i64::MAX)
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockFailed)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn put_record(&self, record: &HydrationRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| upsert_record(conn, &record)).await
    }

    async fn put_records(&self, records: &[HydrationRecord]) -> Result<(), StoreError> {
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for record in &records {
                upsert_record(&tx, record)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_record(&self, id: &RecordId) -> Result<Option<HydrationRecord>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {RECORD_COLUMNS} FROM hydration_records WHERE id = ?1"),
                    params![id.as_str()],
                    RecordRow::from_row,
                )
                .optional()?;
            row.map(RecordRow::into_record).transpose()
        })
        .await
    }

    async fn all_records(&self) -> Result<Vec<HydrationRecord>, StoreError> {
        self.with_conn(|conn| {
            query_records(
                conn,
                &format!("SELECT {RECORD_COLUMNS} FROM hydration_records ORDER BY timestamp_ms, id"),
                [],
            )
        })
        .await
    }

    async fn records_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HydrationRecord>, StoreError> {
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        self.with_conn(move |conn| {
            query_records(
                conn,
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM hydration_records
                     WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2
                     ORDER BY timestamp_ms, id"
                ),
                params![start_ms, end_ms],
            )
        })
        .await
    }

    async fn delete_record(&self, id: &RecordId) -> Result<bool, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let removed =
                conn.execute("DELETE FROM hydration_records WHERE id = ?1", params![id.as_str()])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn enqueue(&self, op: &OfflineOperation) -> Result<(), StoreError> {
        let op = op.clone();
        self.with_conn(move |conn| {
            let data = serde_json::to_string(&op)?;
            conn.execute(
                "INSERT INTO offline_queue (op_id, local_id, action, data, enqueued_at, retry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(op_id) DO UPDATE SET
                    local_id = excluded.local_id,
                    action = excluded.action,
                    data = excluded.data,
                    retry_count = excluded.retry_count",
                params![
                    op.op_id.as_str(),
                    op.local_id.as_str(),
                    op.action().as_str(),
                    data,
                    enqueued_at_sql(&op),
                    op.retry_count,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn dequeue(&self, op_id: &OpId) -> Result<Option<OfflineOperation>, StoreError> {
        let op_id = op_id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let data: Option<String> = tx
                .query_row(
                    "SELECT data FROM offline_queue WHERE op_id = ?1",
                    params![op_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute(
                "DELETE FROM offline_queue WHERE op_id = ?1",
                params![op_id.as_str()],
            )?;
            tx.commit()?;
            Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
        })
        .await
    }

    async fn dequeue_many(&self, op_ids: &[OpId]) -> Result<usize, StoreError> {
        let op_ids = op_ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM offline_queue WHERE op_id = ?1")?;
                for op_id in &op_ids {
                    removed += stmt.execute(params![op_id.as_str()])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn update_operation(&self, op: &OfflineOperation) -> Result<bool, StoreError> {
        let op = op.clone();
        self.with_conn(move |conn| {
            let data = serde_json::to_string(&op)?;
            let updated = conn.execute(
                "UPDATE offline_queue
                 SET local_id = ?2, action = ?3, data = ?4, retry_count = ?5
                 WHERE op_id = ?1",
                params![
                    op.op_id.as_str(),
                    op.local_id.as_str(),
                    op.action().as_str(),
                    data,
                    op.retry_count,
                ],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn queued_operations(&self) -> Result<Vec<OfflineOperation>, StoreError> {
        self.with_conn(|conn| query_queue(conn)).await
    }

    async fn clear_queue(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM offline_queue", [])?;
            Ok(())
        })
        .await
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        validate_setting_key(key)?;
        let key = key.to_string();
        let value = serde_json::to_string(value)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        validate_setting_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
        })
        .await
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM hydration_records", [])?;
            tx.execute("DELETE FROM offline_queue", [])?;
            tx.execute("DELETE FROM settings", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<usize, StoreError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(usize::try_from(n).unwrap_or_default())
            };
            Ok(StoreStats {
                total_records: count("SELECT COUNT(*) FROM hydration_records")?,
                unsynced_records: count("SELECT COUNT(*) FROM hydration_records WHERE synced = 0")?,
                queued_operations: count("SELECT COUNT(*) FROM offline_queue")?,
                settings: count("SELECT COUNT(*) FROM settings")?,
            })
        })
        .await
    }
}
