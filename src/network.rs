//! Online/offline state machine with active health probing.
//!
//! Platform connectivity events drive transitions directly. While online, a
//! background task probes the remote health endpoint; a probe that times out,
//! or `failure_threshold` consecutive failed probes, force the monitor offline
//! even when the platform still reports connectivity.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::remote::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

impl NetworkQuality {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_type: Option<String>,
    pub effective_type: Option<String>,
    /// Mbit/s
    pub downlink: Option<f64>,
    /// Milliseconds
    pub rtt: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_online: bool,
    pub connection_type: Option<String>,
    pub effective_type: Option<String>,
    pub downlink: Option<f64>,
    pub rtt: Option<f64>,
}

/// Coarse quality from the last known connection hints.
#[must_use]
pub fn classify_quality(status: &NetworkStatus) -> NetworkQuality {
    if !status.is_online {
        return NetworkQuality::Poor;
    }
    let Some(effective_type) = status.effective_type.as_deref() else {
        return NetworkQuality::Unknown;
    };

    match effective_type {
        "4g" => NetworkQuality::Excellent,
        "3g" => NetworkQuality::Good,
        "2g" => NetworkQuality::Fair,
        "slow-2g" => NetworkQuality::Poor,
        _ => match (status.rtt, status.downlink) {
            (Some(rtt), Some(downlink)) => {
                if rtt < 100.0 && downlink > 10.0 {
                    NetworkQuality::Excellent
                } else if rtt < 300.0 && downlink > 1.5 {
                    NetworkQuality::Good
                } else if rtt < 1000.0 && downlink > 0.5 {
                    NetworkQuality::Fair
                } else {
                    NetworkQuality::Poor
                }
            }
            _ => NetworkQuality::Unknown,
        },
    }
}

/// Lightweight reachability check against the remote service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), RemoteError>;
}

/// Callbacks for network transitions. A panicking callback is logged and does
/// not stop delivery to other listeners.
pub trait NetworkListener: Send + Sync {
    fn on_online(&self) {}
    fn on_offline(&self) {}
    fn on_connection_change(&self, _status: &NetworkStatus, _quality: NetworkQuality) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Healthy,
    TimedOut,
    Failed,
}

struct MonitorState {
    status: NetworkStatus,
    platform_online: bool,
    consecutive_failures: u32,
    probe_task: Option<JoinHandle<()>>,
}

struct MonitorInner {
    config: NetworkConfig,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<MonitorState>,
    listeners: Mutex<Vec<(u64, Arc<dyn NetworkListener>)>>,
    next_listener_id: AtomicU64,
}

/// Returned by [`NetworkMonitor::add_listener`].
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl ListenerHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner.remove_listener(self.id);
        }
    }
}

impl std::fmt::Debug for MonitorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorInner").finish_non_exhaustive()
    }
}

struct UnsubscribeOnDrop(Option<ListenerHandle>);

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.unsubscribe();
        }
    }
}

struct OnlineWaiter {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl NetworkListener for OnlineWaiter {
    fn on_online(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

impl MonitorInner {
    fn remove_listener(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    fn is_online(&self) -> bool {
        self.state.lock().map(|s| s.status.is_online).unwrap_or(false)
    }

    fn notify(&self, event: &str, f: impl Fn(&dyn NetworkListener)) {
        let snapshot: Vec<Arc<dyn NetworkListener>> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                error!(event, "Network listener panicked");
            }
        }
    }
}

fn spawn_probe_loop(inner: &Arc<MonitorInner>) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No async runtime available, health probing disabled");
        return None;
    };
    let weak = Arc::downgrade(inner);
    let period = inner.config.health_check_interval();

    Some(runtime.spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            let Some(inner) = weak.upgrade() else { break };
            if !inner.is_online() {
                break;
            }
            let outcome = run_probe(&inner).await;
            if !record_probe_outcome(&inner, outcome) {
                break;
            }
        }
    }))
}

async fn run_probe(inner: &MonitorInner) -> ProbeOutcome {
    match tokio::time::timeout(inner.config.probe_timeout(), inner.probe.probe()).await {
        Ok(Ok(())) => ProbeOutcome::Healthy,
        Ok(Err(RemoteError::Timeout { .. })) | Err(_) => ProbeOutcome::TimedOut,
        Ok(Err(e)) => {
            debug!(error = %e, "Health probe failed");
            ProbeOutcome::Failed
        }
    }
}

/// Applies a periodic probe result. Returns false once the monitor went offline.
fn record_probe_outcome(inner: &Arc<MonitorInner>, outcome: ProbeOutcome) -> bool {
    let force_offline = {
        let Ok(mut state) = inner.state.lock() else {
            return false;
        };
        match outcome {
            ProbeOutcome::Healthy => {
                state.consecutive_failures = 0;
                false
            }
            ProbeOutcome::TimedOut => {
                warn!("Health probe timed out");
                true
            }
            ProbeOutcome::Failed => {
                state.consecutive_failures += 1;
                warn!(
                    failures = state.consecutive_failures,
                    threshold = inner.config.failure_threshold,
                    "Health probe failed"
                );
                state.consecutive_failures >= inner.config.failure_threshold
            }
        }
    };

    if force_offline {
        transition(inner, false, "health probe");
        return false;
    }
    true
}

fn transition(inner: &Arc<MonitorInner>, online: bool, cause: &'static str) -> bool {
    let changed = {
        let Ok(mut state) = inner.state.lock() else {
            return false;
        };
        if state.status.is_online == online {
            false
        } else {
            state.status.is_online = online;
            state.consecutive_failures = 0;
            if online {
                let idle = state
                    .probe_task
                    .as_ref()
                    .map_or(true, JoinHandle::is_finished);
                if idle {
                    state.probe_task = spawn_probe_loop(inner);
                }
            } else if let Some(task) = state.probe_task.take() {
                task.abort();
            }
            true
        }
    };

    if changed {
        if online {
            info!(cause, "Network online");
            inner.notify("online", |l| l.on_online());
        } else {
            warn!(cause, "Network offline");
            inner.notify("offline", |l| l.on_offline());
        }
    }
    changed
}

#[derive(Clone, Debug)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    pub fn new(config: NetworkConfig, probe: Arc<dyn HealthProbe>, initially_online: bool) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                state: Mutex::new(MonitorState {
                    status: NetworkStatus {
                        is_online: initially_online,
                        ..NetworkStatus::default()
                    },
                    platform_online: initially_online,
                    consecutive_failures: 0,
                    probe_task: None,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Starts health probing if currently online. Requires a Tokio runtime.
    pub fn start(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            let idle = state
                .probe_task
                .as_ref()
                .map_or(true, JoinHandle::is_finished);
            if state.status.is_online && idle {
                state.probe_task = spawn_probe_loop(&self.inner);
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> NetworkStatus {
        self.inner
            .state
            .lock()
            .map(|s| s.status.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    #[must_use]
    pub fn quality(&self) -> NetworkQuality {
        classify_quality(&self.status())
    }

    /// Edge-triggered platform connectivity event.
    pub fn set_platform_online(&self, online: bool) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.platform_online = online;
        }
        transition(&self.inner, online, "platform event");
    }

    pub fn update_connection_info(&self, info: ConnectionInfo) {
        let status = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            state.status.connection_type = info.connection_type;
            state.status.effective_type = info.effective_type;
            state.status.downlink = info.downlink;
            state.status.rtt = info.rtt;
            state.status.clone()
        };
        let quality = classify_quality(&status);
        debug!(quality = quality.as_str(), "Connection info changed");
        self.inner
            .notify("connection_change", |l| l.on_connection_change(&status, quality));
    }

    /// Probes the remote now and reconciles the cached state with the result.
    pub async fn check_connectivity(&self) -> bool {
        let platform_online = self
            .inner
            .state
            .lock()
            .map(|s| s.platform_online)
            .unwrap_or(false);
        if !platform_online {
            return false;
        }

        let reachable = run_probe(&self.inner).await == ProbeOutcome::Healthy;
        if reachable != self.is_online() {
            transition(&self.inner, reachable, "connectivity check");
        }
        reachable
    }

    /// Resolves true once online, or false after `timeout`.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        if self.is_online() {
            return true;
        }

        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(OnlineWaiter {
            tx: Mutex::new(Some(tx)),
        });
        let _guard = UnsubscribeOnDrop(Some(self.add_listener(waiter)));

        // Re-check in case the transition landed before registration.
        if self.is_online() {
            return true;
        }
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    pub async fn wait_for_connection_default(&self) -> bool {
        let timeout = Duration::from_millis(self.inner.config.wait_for_connection_timeout_ms);
        self.wait_for_connection(timeout).await
    }

    pub fn add_listener(&self, listener: Arc<dyn NetworkListener>) -> ListenerHandle {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((id, listener));
        }
        ListenerHandle {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn remove_listener(&self, id: u64) {
        self.inner.remove_listener(id);
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Stops probing and drops every listener.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            if let Some(task) = state.probe_task.take() {
                task.abort();
            }
        }
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.clear();
        }
        info!("Network monitor stopped");
    }
}
