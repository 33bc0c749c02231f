use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RecordId);
typed_id!(LocalId);

impl From<&RecordId> for LocalId {
    fn from(id: &RecordId) -> Self {
        LocalId(id.0.clone())
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default())
    }

    #[must_use]
    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HydrationRecord {
    pub id: RecordId,
    /// Millilitres, always within the accepted intake range.
    pub volume: u32,
    pub timestamp: DateTime<Utc>,
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
}

impl HydrationRecord {
    #[must_use]
    pub fn new(volume: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::generate(),
            volume,
            timestamp,
            synced: false,
            local_id: None,
        }
    }

    /// Stable correlation id between the record and its queued operations.
    #[must_use]
    pub fn correlation_id(&self) -> LocalId {
        self.local_id
            .clone()
            .unwrap_or_else(|| LocalId::from(&self.id))
    }

    #[must_use]
    pub fn is_on_day<Tz: TimeZone>(&self, day: NaiveDate, tz: &Tz) -> bool {
        self.timestamp.with_timezone(tz).date_naive() == day
    }

    pub fn apply_patch(&mut self, patch: &RecordPatch) {
        if let Some(volume) = patch.volume {
            self.volume = volume;
        }
        if let Some(timestamp) = patch.timestamp {
            self.timestamp = timestamp;
        }
    }
}

/// Validated partial update of a record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RecordPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volume.is_none() && self.timestamp.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_count: usize,
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: NaiveDate,
    #[serde(alias = "total_volume")]
    pub total_volume: u32,
    #[serde(alias = "goal_volume")]
    pub goal_volume: u32,
    /// Percentage of the goal reached, may exceed 100.
    #[serde(alias = "completion_rate")]
    pub completion_rate: f64,
    #[serde(alias = "record_count")]
    pub record_count: usize,
}

impl DailySummary {
    #[must_use]
    pub fn compute<Tz: TimeZone>(
        records: &[HydrationRecord],
        day: NaiveDate,
        tz: &Tz,
        goal_volume: u32,
    ) -> Self {
        let todays: Vec<&HydrationRecord> =
            records.iter().filter(|r| r.is_on_day(day, tz)).collect();
        let total_volume = todays
            .iter()
            .fold(0u32, |acc, r| acc.saturating_add(r.volume));
        let completion_rate = if goal_volume > 0 {
            f64::from(total_volume) / f64::from(goal_volume) * 100.0
        } else {
            0.0
        };

        Self {
            date: day,
            total_volume,
            goal_volume,
            completion_rate,
            record_count: todays.len(),
        }
    }
}

/// Sum of volumes for records falling on `day` in the given timezone.
#[must_use]
pub fn daily_total<Tz: TimeZone>(records: &[HydrationRecord], day: NaiveDate, tz: &Tz) -> u32 {
    records
        .iter()
        .filter(|r| r.is_on_day(day, tz))
        .fold(0u32, |acc, r| acc.saturating_add(r.volume))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};

    fn record_at(volume: u32, ts: &str) -> HydrationRecord {
        let timestamp = DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc);
        HydrationRecord::new(volume, timestamp)
    }

    #[test]
    fn daily_total_uses_local_calendar_day() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let records = vec![
            record_at(250, "2024-03-10T21:30:00Z"),
            record_at(500, "2024-03-10T23:30:00Z"),
            record_at(300, "2024-03-10T08:00:00Z"),
        ];

        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let next = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();

        assert_eq!(daily_total(&records, day, &tz), 550);
        assert_eq!(daily_total(&records, next, &tz), 500);
        assert_eq!(daily_total(&records, day, &Utc), 1050);
    }

    #[test]
    fn summary_completion_rate_is_percentage() {
        let now = Utc::now();
        let records = vec![
            HydrationRecord::new(500, now),
            HydrationRecord::new(1000, now),
            HydrationRecord::new(700, now - Duration::days(3)),
        ];

        let summary = DailySummary::compute(&records, now.date_naive(), &Utc, 2000);

        assert_eq!(summary.total_volume, 1500);
        assert_eq!(summary.record_count, 2);
        assert!((summary.completion_rate - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_with_zero_goal_has_zero_rate() {
        let summary = DailySummary::compute(&[], Utc::now().date_naive(), &Utc, 0);
        assert_eq!(summary.completion_rate, 0.0);
    }

    #[test]
    fn summary_accepts_backend_field_names() {
        let json = r#"{"date":"2024-01-15","total_volume":1500,"goal_volume":2000,"completion_rate":75.0,"record_count":5}"#;
        let summary: DailySummary = serde_json::from_str(json).unwrap();
        assert_eq!(summary.total_volume, 1500);
        assert_eq!(summary.record_count, 5);
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let mut record = record_at(250, "2024-03-10T08:00:00Z");
        let original_ts = record.timestamp;

        record.apply_patch(&RecordPatch {
            volume: Some(400),
            timestamp: None,
        });

        assert_eq!(record.volume, 400);
        assert_eq!(record.timestamp, original_ts);
        assert!(RecordPatch::default().is_empty());
    }

    #[test]
    fn correlation_id_prefers_local_id() {
        let mut record = record_at(250, "2024-03-10T08:00:00Z");
        assert_eq!(record.correlation_id().as_str(), record.id.as_str());

        record.local_id = Some(LocalId::new("local-1"));
        assert_eq!(record.correlation_id().as_str(), "local-1");
    }

    #[test]
    fn record_serializes_camel_case() {
        let mut record = record_at(250, "2024-03-10T08:00:00Z");
        record.local_id = Some(LocalId::new("l1"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["localId"], "l1");
        assert_eq!(json["volume"], 250);
        assert_eq!(json["synced"], false);
    }
}
