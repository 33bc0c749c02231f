//! Error reporting and the user-facing feedback stream.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::error::{AppError, ErrorCategory, ErrorKind, ErrorSeverity};

pub const ERROR_HISTORY_LIMIT: usize = 100;
const FEEDBACK_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Success,
    Info,
    Warning,
    Error,
}

/// A message for the shell to show the user. `duration_ms == None` means the
/// message stays until dismissed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEvent {
    pub kind: FeedbackKind,
    pub title: String,
    pub message: String,
    pub duration_ms: Option<u64>,
}

impl FeedbackEvent {
    #[must_use]
    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FeedbackKind::Success,
            title: title.into(),
            message: message.into(),
            duration_ms: Some(3_000),
        }
    }

    #[must_use]
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FeedbackKind::Info,
            title: title.into(),
            message: message.into(),
            duration_ms: Some(3_000),
        }
    }

    #[must_use]
    pub fn from_error(info: &ErrorInfo) -> Self {
        let (kind, duration_ms) = match info.severity {
            ErrorSeverity::Low => (FeedbackKind::Warning, Some(3_000)),
            ErrorSeverity::Medium => (FeedbackKind::Error, Some(5_000)),
            ErrorSeverity::High => (FeedbackKind::Error, Some(8_000)),
            ErrorSeverity::Critical => (FeedbackKind::Error, None),
        };
        Self {
            kind,
            title: info.kind.title().to_string(),
            message: info.user_message.clone(),
            duration_ms,
        }
    }
}

/// Structured snapshot of a reported error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: String,
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub user_message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    #[must_use]
    pub fn from_app_error(err: &AppError, context: HashMap<String, String>) -> Self {
        let mut merged = err.context.clone();
        merged.extend(context);
        Self {
            code: err.code().to_string(),
            kind: err.kind,
            category: err.category(),
            severity: err.severity,
            message: err
                .internal_message
                .clone()
                .unwrap_or_else(|| err.message.clone()),
            user_message: err.user_facing_message(),
            retryable: err.is_retryable(),
            timestamp: Utc::now(),
            context: merged,
        }
    }
}

type ErrorListener = Arc<dyn Fn(&ErrorInfo) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the most recent errors, newest first, and fans them out to listeners.
pub struct ErrorReporter {
    history: Mutex<VecDeque<ErrorInfo>>,
    listeners: Mutex<Vec<(u64, ErrorListener)>>,
    next_listener_id: AtomicU64,
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("history_len", &lock(&self.history).len())
            .field("listeners", &lock(&self.listeners).len())
            .finish()
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorReporter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(ERROR_HISTORY_LIMIT)),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn report(&self, err: &AppError, context: HashMap<String, String>) -> ErrorInfo {
        let info = ErrorInfo::from_app_error(err, context);

        match info.severity {
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(code = %info.code, severity = info.severity.as_str(), message = %info.message, "Error reported");
            }
            ErrorSeverity::Low | ErrorSeverity::Medium => {
                warn!(code = %info.code, severity = info.severity.as_str(), message = %info.message, "Error reported");
            }
        }

        {
            let mut history = lock(&self.history);
            history.push_front(info.clone());
            history.truncate(ERROR_HISTORY_LIMIT);
        }

        let listeners: Vec<ErrorListener> =
            lock(&self.listeners).iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&info);
        }

        info
    }

    /// Newest first.
    #[must_use]
    pub fn history(&self) -> Vec<ErrorInfo> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.history).clear();
    }

    pub fn add_listener(&self, listener: impl Fn(&ErrorInfo) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        lock(&self.listeners).retain(|(lid, _)| *lid != id);
    }
}

/// Broadcasts [`FeedbackEvent`]s to every subscriber.
#[derive(Debug, Clone)]
pub struct FeedbackHub {
    sender: broadcast::Sender<FeedbackEvent>,
}

impl Default for FeedbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackHub {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FEEDBACK_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Sends to current subscribers. Having none is not an error.
    pub fn emit(&self, event: FeedbackEvent) {
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FeedbackEvent> {
        self.sender.subscribe()
    }
}
