//! Remote hydration API: error model, DTOs and the HTTP client.

mod http;
mod retry;

pub use http::{decode_payload, HttpRemoteClient};
pub use retry::{backoff_delay, backoff_delay_with, retry_with_backoff, RetryConfig};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DailySummary, HydrationRecord, RecordId, RecordPatch};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        error_code: Option<String>,
    },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl RemoteError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "TIMEOUT_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Http { .. } => "HTTP_ERROR",
            Self::InvalidUrl(_) | Self::Decode(_) | Self::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 4xx responses other than 408/429 are terminal, as is any error whose
    /// message mentions validation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network(_) => true,
            Self::Http {
                status, message, ..
            } => {
                if (400..500).contains(status) && *status != 408 && *status != 429 {
                    return false;
                }
                !mentions_validation(message)
            }
            Self::InvalidUrl(_) | Self::Decode(_) => false,
            Self::Unknown(message) => !mentions_validation(message),
        }
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Http { status: 409, .. })
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }
}

fn mentions_validation(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("validation") || lower.contains("invalid")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateRecordRequest {
    pub volume: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl From<&HydrationRecord> for CreateRecordRequest {
    fn from(record: &HydrationRecord) -> Self {
        Self {
            volume: record.volume,
            recorded_at: Some(record.timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct UpdateRecordRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl From<&RecordPatch> for UpdateRecordRequest {
    fn from(patch: &RecordPatch) -> Self {
        Self {
            volume: patch.volume,
            recorded_at: patch.timestamp,
        }
    }
}

/// Record as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteRecord {
    #[serde(deserialize_with = "flexible_id::deserialize")]
    pub id: String,
    pub volume: u32,
    #[serde(alias = "recordedAt", alias = "timestamp")]
    #[serde(deserialize_with = "flexible_datetime::deserialize")]
    pub recorded_at: DateTime<Utc>,
}

impl From<RemoteRecord> for HydrationRecord {
    fn from(remote: RemoteRecord) -> Self {
        HydrationRecord {
            id: RecordId::new(remote.id),
            volume: remote.volume,
            timestamp: remote.recorded_at,
            synced: true,
            local_id: None,
        }
    }
}

/// Backend ids may be numeric or strings.
mod flexible_id {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        })
    }
}

/// RFC 3339, or a naive ISO-8601 datetime interpreted as UTC.
mod flexible_datetime {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid datetime: {raw}")))
    }
}

/// Hydration REST API. Implementations must be cancellation-safe: dropping a
/// call's future abandons the request.
#[async_trait]
pub trait HydrationApi: Send + Sync {
    async fn create_record(
        &self,
        request: &CreateRecordRequest,
    ) -> Result<HydrationRecord, RemoteError>;

    async fn update_record(
        &self,
        id: &RecordId,
        request: &UpdateRecordRequest,
    ) -> Result<HydrationRecord, RemoteError>;

    async fn delete_record(&self, id: &RecordId) -> Result<(), RemoteError>;

    async fn get_record(&self, id: &RecordId) -> Result<HydrationRecord, RemoteError>;

    async fn daily_summary(&self, date: Option<NaiveDate>) -> Result<DailySummary, RemoteError>;

    async fn health_check(&self) -> Result<(), RemoteError>;
}
