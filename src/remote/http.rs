use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::{
    CreateRecordRequest, HydrationApi, RemoteError, RemoteRecord, UpdateRecordRequest,
};
use crate::config::RemoteConfig;
use crate::model::{DailySummary, HydrationRecord, RecordId};
use crate::network::HealthProbe;

const MAX_ERROR_MESSAGE_LEN: usize = 512;

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default, alias = "errorCode", alias = "code")]
    error_code: Option<String>,
}

impl ApiErrorBody {
    fn message(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .or_else(|| match &self.detail {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
                None => None,
            })
    }
}

/// Unwraps `{ "data": ... }` envelopes, accepting bare payloads as well.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RemoteError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| RemoteError::Decode(e.to_string()))?;

    let payload = match value {
        serde_json::Value::Object(mut map) if map.contains_key("data") => map
            .remove("data")
            .unwrap_or(serde_json::Value::Null),
        other => other,
    };

    serde_json::from_value(payload).map_err(|e| RemoteError::Decode(e.to_string()))
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

fn http_error(status: StatusCode, body: &[u8]) -> RemoteError {
    let parsed: ApiErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let mut message = parsed.message().unwrap_or_else(|| {
        status
            .canonical_reason()
            .map_or_else(|| format!("HTTP error: {}", status.as_u16()), str::to_string)
    });
    truncate_utf8_safe(&mut message, MAX_ERROR_MESSAGE_LEN);

    RemoteError::Http {
        status: status.as_u16(),
        message,
        error_code: parsed.error_code,
    }
}

fn classify_transport(e: &reqwest::Error, timeout: Duration) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout {
            after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    } else if e.is_connect() || e.is_request() {
        RemoteError::Network(e.to_string())
    } else if e.is_decode() || e.is_body() {
        RemoteError::Decode(e.to_string())
    } else {
        RemoteError::Unknown(e.to_string())
    }
}

/// reqwest-backed client for the hydration REST API.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: Url,
    health_path: String,
    timeout: Duration,
}

impl HttpRemoteClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let base_url =
            Url::parse(&config.base_url).map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(RemoteError::InvalidUrl(format!(
                "unsupported scheme: {}",
                base_url.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            health_path: config.health_path.clone(),
            timeout: config.request_timeout(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn endpoint<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                RemoteError::InvalidUrl(format!("{} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn record_url(&self, id: &RecordId) -> Result<Url, RemoteError> {
        self.endpoint(["hydration", id.as_str()])
    }

    fn health_url(&self) -> Result<Url, RemoteError> {
        self.endpoint(self.health_path.split('/').filter(|s| !s.is_empty()))
    }

    /// Sends a request and returns the raw success body.
    ///
    /// The whole exchange, body included, runs under the configured timeout.
    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<u8>, RemoteError> {
        let timeout = self.timeout;
        let mut builder = self
            .client
            .request(method.clone(), url.clone())
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let exchange = async {
            let response = builder
                .send()
                .await
                .map_err(|e| classify_transport(&e, timeout))?;
            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| classify_transport(&e, timeout))?;
            Ok::<_, RemoteError>((status, bytes))
        };

        let (status, bytes) = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RemoteError::Timeout {
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        };

        debug!(%method, %url, status = status.as_u16(), "Remote response");

        if !status.is_success() {
            return Err(http_error(status, &bytes));
        }
        Ok(bytes.to_vec())
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<T, RemoteError> {
        let bytes = self.execute(method, url, body).await?;
        decode_payload(&bytes)
    }

    fn to_body<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, RemoteError> {
        serde_json::to_value(value).map_err(|e| RemoteError::Unknown(e.to_string()))
    }
}

#[async_trait]
impl HydrationApi for HttpRemoteClient {
    #[instrument(skip(self, request), fields(volume = request.volume))]
    async fn create_record(
        &self,
        request: &CreateRecordRequest,
    ) -> Result<HydrationRecord, RemoteError> {
        let body = Self::to_body(request)?;
        let remote: RemoteRecord = self
            .request_json(Method::POST, self.endpoint(["hydration"])?, Some(body))
            .await?;
        Ok(remote.into())
    }

    #[instrument(skip(self, request), fields(record_id = %id))]
    async fn update_record(
        &self,
        id: &RecordId,
        request: &UpdateRecordRequest,
    ) -> Result<HydrationRecord, RemoteError> {
        let body = Self::to_body(request)?;
        let remote: RemoteRecord = self
            .request_json(Method::PUT, self.record_url(id)?, Some(body))
            .await?;
        Ok(remote.into())
    }

    #[instrument(skip(self), fields(record_id = %id))]
    async fn delete_record(&self, id: &RecordId) -> Result<(), RemoteError> {
        let url = self.record_url(id)?;
        self.execute(Method::DELETE, url, None).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(record_id = %id))]
    async fn get_record(&self, id: &RecordId) -> Result<HydrationRecord, RemoteError> {
        let remote: RemoteRecord = self
            .request_json(Method::GET, self.record_url(id)?, None)
            .await?;
        Ok(remote.into())
    }

    #[instrument(skip(self))]
    async fn daily_summary(&self, date: Option<NaiveDate>) -> Result<DailySummary, RemoteError> {
        let mut url = self.endpoint(["hydration"])?;
        if let Some(date) = date {
            url.query_pairs_mut()
                .append_pair("date", &date.format("%Y-%m-%d").to_string());
        }
        self.request_json(Method::GET, url, None).await
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        let url = self.health_url()?;
        self.execute(Method::GET, url, None).await?;
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for HttpRemoteClient {
    async fn probe(&self) -> Result<(), RemoteError> {
        self.health_check().await
    }
}
