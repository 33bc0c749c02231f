#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use fillup_core::{
    CoreConfig, CreateRecordRequest, DailySummary, HealthProbe, HydrationApi, HydrationRecord,
    LocalStore, NetworkConfig, NetworkMonitor, RecordId, RemoteError, UpdateRecordRequest,
};
use tokio::time::Instant;

/// Minimal in-memory server that logs when each write arrived.
#[derive(Default)]
pub struct FakeServer {
    records: Mutex<BTreeMap<String, HydrationRecord>>,
    writes: Mutex<Vec<Instant>>,
    next_id: AtomicU64,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn write_times(&self) -> Vec<Instant> {
        self.writes.lock().unwrap().clone()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn log_write(&self) {
        self.writes.lock().unwrap().push(Instant::now());
    }

    fn not_found() -> RemoteError {
        RemoteError::Http {
            status: 404,
            message: "not found".into(),
            error_code: None,
        }
    }
}

#[async_trait]
impl HydrationApi for FakeServer {
    async fn create_record(
        &self,
        request: &CreateRecordRequest,
    ) -> Result<HydrationRecord, RemoteError> {
        self.log_write();
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = HydrationRecord {
            id: RecordId::new(format!("server-{n}")),
            volume: request.volume,
            timestamp: request.recorded_at.unwrap_or_else(Utc::now),
            synced: true,
            local_id: None,
        };
        self.records
            .lock()
            .unwrap()
            .insert(record.id.to_string(), record.clone());
        Ok(record)
    }

    async fn update_record(
        &self,
        id: &RecordId,
        request: &UpdateRecordRequest,
    ) -> Result<HydrationRecord, RemoteError> {
        self.log_write();
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(id.as_str()).ok_or_else(Self::not_found)?;
        if let Some(volume) = request.volume {
            record.volume = volume;
        }
        Ok(record.clone())
    }

    async fn delete_record(&self, id: &RecordId) -> Result<(), RemoteError> {
        self.log_write();
        self.records
            .lock()
            .unwrap()
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(Self::not_found)
    }

    async fn get_record(&self, id: &RecordId) -> Result<HydrationRecord, RemoteError> {
        self.records
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(Self::not_found)
    }

    async fn daily_summary(&self, date: Option<NaiveDate>) -> Result<DailySummary, RemoteError> {
        let records: Vec<HydrationRecord> = self.records.lock().unwrap().values().cloned().collect();
        let day = date.unwrap_or_else(|| Utc::now().date_naive());
        Ok(DailySummary::compute(&records, day, &Utc, 2000))
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for FakeServer {
    async fn probe(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

pub fn quiet_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.retry.jitter = false;
    config.coordinator.write_retry.jitter = false;
    config
}

pub fn monitor(server: &Arc<FakeServer>, online: bool) -> NetworkMonitor {
    NetworkMonitor::new(NetworkConfig::default(), server.clone(), online)
}

pub async fn queue_len(store: &dyn LocalStore) -> usize {
    store.queued_operations().await.unwrap().len()
}
