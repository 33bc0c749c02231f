use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::remote::RemoteError;
use crate::store::StoreError;
use crate::validation::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    Validation,
    Storage,
    Sync,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NetworkUnavailable,
    NetworkTimeout,
    ServerError,
    ApiError,
    InvalidVolume,
    InvalidTimestamp,
    ValidationFailed,
    NotFound,
    StorageFull,
    Storage,
    Database,
    SyncFailed,
    ConflictResolutionFailed,
    RetryExhausted,
    Configuration,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::ServerError => "SERVER_ERROR",
            Self::ApiError => "API_ERROR",
            Self::InvalidVolume => "INVALID_VOLUME",
            Self::InvalidTimestamp => "INVALID_TIMESTAMP",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::StorageFull => "STORAGE_FULL",
            Self::Storage => "STORAGE_ERROR",
            Self::Database => "DATABASE_ERROR",
            Self::SyncFailed => "SYNC_FAILED",
            Self::ConflictResolutionFailed => "CONFLICT_RESOLUTION_FAILED",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Cancelled => "OPERATION_CANCELLED",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::NetworkUnavailable | Self::NetworkTimeout | Self::ServerError | Self::ApiError => {
                ErrorCategory::Network
            }
            Self::InvalidVolume
            | Self::InvalidTimestamp
            | Self::ValidationFailed
            | Self::NotFound
            | Self::Configuration => ErrorCategory::Validation,
            Self::StorageFull | Self::Storage | Self::Database => ErrorCategory::Storage,
            Self::SyncFailed | Self::ConflictResolutionFailed | Self::RetryExhausted => {
                ErrorCategory::Sync
            }
            Self::Cancelled | Self::Unknown => ErrorCategory::Unknown,
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::InvalidVolume
            | Self::InvalidTimestamp
            | Self::ValidationFailed
            | Self::NotFound
            | Self::Cancelled => ErrorSeverity::Low,

            Self::NetworkUnavailable
            | Self::NetworkTimeout
            | Self::ServerError
            | Self::ApiError
            | Self::SyncFailed
            | Self::Unknown => ErrorSeverity::Medium,

            Self::Storage
            | Self::ConflictResolutionFailed
            | Self::RetryExhausted
            | Self::Configuration => ErrorSeverity::High,

            Self::StorageFull | Self::Database => ErrorSeverity::Critical,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable
                | Self::NetworkTimeout
                | Self::ServerError
                | Self::Storage
                | Self::SyncFailed
        )
    }

    #[must_use]
    pub const fn title(self) -> &'static str {
        match self.category() {
            ErrorCategory::Network => "Connection Problem",
            ErrorCategory::Validation => "Invalid Input",
            ErrorCategory::Storage => "Storage Error",
            ErrorCategory::Sync => "Sync Error",
            ErrorCategory::Unknown => "Unexpected Error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub status: Option<u16>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            status: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Critical)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::NetworkUnavailable => {
                "Unable to connect to the server. Your data will be saved locally and synced when connection is restored.".into()
            }
            ErrorKind::NetworkTimeout => {
                "The request took too long. Please check your connection and try again.".into()
            }
            ErrorKind::ServerError => {
                "The server is having trouble right now. Please try again in a moment.".into()
            }
            ErrorKind::ApiError => "The server rejected the request. Please try again.".into(),
            ErrorKind::InvalidVolume
            | ErrorKind::InvalidTimestamp
            | ErrorKind::ValidationFailed
            | ErrorKind::Configuration => self.message.clone(),
            ErrorKind::NotFound => "The requested record could not be found.".into(),
            ErrorKind::StorageFull => {
                "Your device storage is full. Please free up some space.".into()
            }
            ErrorKind::Storage | ErrorKind::Database => {
                "Unable to save data locally. Please try again.".into()
            }
            ErrorKind::SyncFailed => {
                "Some changes could not be synced. They will be retried automatically.".into()
            }
            ErrorKind::ConflictResolutionFailed => {
                "A change conflicted with the server and could not be resolved.".into()
            }
            ErrorKind::RetryExhausted => {
                "The operation failed after several attempts. Please try again later.".into()
            }
            ErrorKind::Cancelled => "The operation was cancelled.".into(),
            ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::ValidationFailed,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::NetworkTimeout,
            409 => ErrorKind::ConflictResolutionFailed,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::ApiError,
        };

        Self::new(kind, message)
            .with_status(status)
            .with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        let kind = match e {
            ValidationError::VolumeOutOfRange { .. } => ErrorKind::InvalidVolume,
            ValidationError::TimestampInFuture | ValidationError::TimestampTooOld => {
                ErrorKind::InvalidTimestamp
            }
            ValidationError::InvalidGoal { .. } => ErrorKind::ValidationFailed,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<RemoteError> for AppError {
    fn from(e: RemoteError) -> Self {
        match &e {
            RemoteError::Timeout { .. } => {
                AppError::new(ErrorKind::NetworkTimeout, "Request timed out")
                    .with_internal(e.to_string())
            }
            RemoteError::Network(_) => {
                AppError::new(ErrorKind::NetworkUnavailable, "Network request failed")
                    .with_internal(e.to_string())
            }
            RemoteError::Http { status, message, .. } => {
                AppError::from_http_status(*status, message.clone()).with_internal(e.to_string())
            }
            RemoteError::InvalidUrl(_) => {
                AppError::new(ErrorKind::Configuration, e.to_string())
            }
            RemoteError::Decode(_) | RemoteError::Unknown(_) => {
                AppError::new(ErrorKind::Unknown, "Unexpected server response")
                    .with_internal(e.to_string())
            }
        }
        .with_context("remote_code", e.code())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::QuotaExceeded { .. } | StoreError::StoreTooLarge { .. } => {
                ErrorKind::StorageFull
            }
            #[cfg(not(target_arch = "wasm32"))]
            StoreError::Sqlite(_) => ErrorKind::Database,
            StoreError::InvalidKey { .. } => ErrorKind::ValidationFailed,
            _ => ErrorKind::Storage,
        };
        AppError::new(kind, "Local storage operation failed").with_internal(e.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        AppError::new(ErrorKind::ValidationFailed, e.to_string())
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}
