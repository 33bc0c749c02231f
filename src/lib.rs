// lib.rs - Offline-first hydration core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod feedback;
pub mod model;
pub mod network;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;
pub mod units;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{
    ConfigError, CoordinatorConfig, CoreConfig, NetworkConfig, RemoteConfig, StoreConfig,
    SyncConfig,
};
pub use coordinator::{
    Coordinator, HydrationState, RecordUpdate, RemotePhase, SyncOutcome, SyncSkipReason,
    SyncSummary, WriteOutcome,
};
pub use error::{AppError, AppResult, ErrorCategory, ErrorKind, ErrorSeverity};
pub use feedback::{ErrorInfo, ErrorReporter, FeedbackEvent, FeedbackHub, FeedbackKind};
pub use model::{
    DailySummary, HydrationRecord, LocalId, RecordId, RecordPatch, SyncStatus, UnixTimeMs,
};
pub use network::{
    classify_quality, ConnectionInfo, HealthProbe, ListenerHandle, NetworkListener,
    NetworkMonitor, NetworkQuality, NetworkStatus,
};
pub use queue::{OfflineOperation, OpId, OperationAction, OperationPayload, QueueError};
pub use remote::{
    retry_with_backoff, CreateRecordRequest, HttpRemoteClient, HydrationApi, RemoteError,
    RetryConfig, UpdateRecordRequest,
};
pub use store::{open_store, FallbackStore, LocalStore, ResilientStore, StoreError, StoreStats};
pub use sync::{
    resolve_conflict, ConflictDecision, ConflictResolution, ConflictWinner, FailedOperation,
    SyncEngine, SyncPlan, SyncResult, SyncedOperation,
};
pub use units::{ml_to_oz, oz_to_ml, UnitError, VolumeUnit};

#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteStore;

pub const MIN_VOLUME_ML: u32 = 1;
pub const MAX_VOLUME_ML: u32 = 5000;
pub const DEFAULT_DAILY_GOAL_ML: u32 = 2000;
pub const DEFAULT_RETRY_CEILING: u32 = 5;
pub const DAILY_GOAL_SETTING_KEY: &str = "dailyGoal";
