// ── Device runtime ──
//
// One `DeviceRuntime` per managed device. Commands flow through a
// bounded mpsc channel into a single processing task; a second task
// emits heartbeats. Both tasks hold an `Arc<RuntimeInner>` and a child
// cancellation token that is replaced on every `start()`.

mod callbacks;
mod handlers;
mod tasks;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandEnvelope, CommandKind, CommandResult, CommandStatus, Params};
use crate::config::DeviceConfig;
use crate::device::{DeviceBehavior, DeviceContext};
use crate::error::{CoreError, ErrorCode};
use crate::model::{
    DeviceDiagnostics, DeviceStats, DeviceStatus, ErrorRing, HeartbeatSnapshot, StatusSnapshot,
    to_payload,
};
use crate::telemetry::{RecordKind, TelemetryBuffer, TelemetryRecord};

pub use callbacks::CallbackError;
use callbacks::CallbackList;

/// How long the processing loop waits on the queue before re-checking state.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Mutable per-device fields, guarded by a short-held lock.
struct RuntimeState {
    firmware_version: String,
    last_heartbeat: Option<DateTime<Utc>>,
    last_command: Option<DateTime<Utc>>,
    last_status_update: Option<DateTime<Utc>>,
    error_count: u64,
    errors: ErrorRing,
    stats: DeviceStats,
}

/// Join handles of the running loops. `processor` is `Some` exactly
/// while the runtime is started.
#[derive(Default)]
struct TaskSet {
    processor: Option<JoinHandle<mpsc::Receiver<CommandEnvelope>>>,
    heartbeat: Option<JoinHandle<()>>,
}

pub(crate) struct RuntimeInner {
    config: DeviceConfig,
    behavior: Arc<dyn DeviceBehavior>,
    telemetry: Option<Arc<dyn TelemetryBuffer>>,
    attributes: Arc<DashMap<String, Value>>,
    ctx: DeviceContext,
    status_tx: watch::Sender<DeviceStatus>,
    state: Mutex<RuntimeState>,
    status_callbacks: CallbackList<StatusSnapshot>,
    heartbeat_callbacks: CallbackList<HeartbeatSnapshot>,
    command_tx: Mutex<mpsc::Sender<CommandEnvelope>>,
    command_rx: Mutex<Option<mpsc::Receiver<CommandEnvelope>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    /// Root token; cancelled when the runtime is dropped.
    cancel: CancellationToken,
    /// Child token for the current run, replaced on every start.
    cancel_child: Mutex<CancellationToken>,
    tasks: Mutex<TaskSet>,
}

/// Runtime of a single simulated device.
///
/// Constructed OFFLINE. [`start()`](Self::start) moves it ONLINE and
/// spawns the processing and heartbeat loops; [`stop()`](Self::stop)
/// cancels them and waits for both to exit. Dropping the runtime cancels
/// any loop still running.
///
/// Share it across tasks with `Arc<DeviceRuntime>`.
pub struct DeviceRuntime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for DeviceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRuntime")
            .field("device_id", &self.device_id())
            .field("device_type", &self.device_type())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl DeviceRuntime {
    pub fn new(
        config: DeviceConfig,
        behavior: Arc<dyn DeviceBehavior>,
        telemetry: Option<Arc<dyn TelemetryBuffer>>,
    ) -> Self {
        let attributes = Arc::new(DashMap::new());
        for (key, value) in behavior.initial_attributes() {
            attributes.insert(key, value);
        }
        let ctx = DeviceContext::new(
            config.device_id.as_str(),
            attributes.clone(),
            telemetry.clone(),
        );
        let capacity = config.max_command_queue;
        let (command_tx, command_rx) = mpsc::channel(capacity.max(1));
        let (status_tx, _) = watch::channel(DeviceStatus::Offline);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();

        let state = RuntimeState {
            firmware_version: config.firmware_version.clone(),
            last_heartbeat: None,
            last_command: None,
            last_status_update: None,
            error_count: 0,
            errors: ErrorRing::new(config.error_history),
            stats: DeviceStats::new(),
        };

        debug!(device_id = %config.device_id, device_type = %config.device_type, "device runtime created");

        Self {
            inner: Arc::new(RuntimeInner {
                config,
                behavior,
                telemetry,
                attributes,
                ctx,
                status_tx,
                state: Mutex::new(state),
                status_callbacks: CallbackList::new("status"),
                heartbeat_callbacks: CallbackList::new("heartbeat"),
                command_tx: Mutex::new(command_tx),
                command_rx: Mutex::new(Some(command_rx)),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                cancel,
                cancel_child: Mutex::new(cancel_child),
                tasks: Mutex::new(TaskSet::default()),
            }),
        }
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn device_id(&self) -> &str {
        &self.inner.config.device_id
    }

    pub fn device_type(&self) -> &str {
        &self.inner.config.device_type
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn firmware_version(&self) -> String {
        self.inner.state.lock().firmware_version.clone()
    }

    // ── State ────────────────────────────────────────────────────────

    pub fn status(&self) -> DeviceStatus {
        self.inner.status()
    }

    /// Subscribe to state changes.
    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Whether the processing loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.tasks.lock().processor.is_some()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Transition to ONLINE and spawn the processing and heartbeat loops.
    /// No-op if already started.
    pub async fn start(&self) {
        let snapshot = {
            let mut handles = self.inner.tasks.lock();
            if handles.processor.is_some() {
                return;
            }
            let Some(rx) = self.inner.command_rx.lock().take() else {
                warn!(device_id = self.device_id(), "command receiver missing, cannot start");
                return;
            };

            let token = self.inner.cancel.child_token();
            *self.inner.cancel_child.lock() = token.clone();
            self.inner.state.lock().stats.uptime_start = Some(Utc::now());

            let snapshot = self.inner.apply_status(DeviceStatus::Online);
            handles.processor = Some(tokio::spawn(tasks::process_commands(
                Arc::clone(&self.inner),
                rx,
                token.clone(),
            )));
            handles.heartbeat = Some(tokio::spawn(tasks::heartbeat_loop(
                Arc::clone(&self.inner),
                token,
            )));
            snapshot
        };

        info!(device_id = self.device_id(), "device started");
        if let Some(snapshot) = snapshot {
            self.inner.publish_status(snapshot).await;
        }
    }

    /// Transition to OFFLINE, cancel both loops and wait until they have
    /// exited. Commands still queued are answered with `DEVICE_OFFLINE`.
    /// No-op if not started.
    pub async fn stop(&self) {
        let (processor, heartbeat, snapshot) = {
            let mut handles = self.inner.tasks.lock();
            if handles.processor.is_none() {
                return;
            }
            self.inner.cancel_child.lock().cancel();
            let snapshot = self.inner.apply_status(DeviceStatus::Offline);
            (handles.processor.take(), handles.heartbeat.take(), snapshot)
        };

        if let Some(handle) = heartbeat {
            if let Err(e) = handle.await {
                warn!(device_id = self.device_id(), error = %e, "heartbeat task ended abnormally");
            }
        }
        let receiver = match processor {
            Some(handle) => match handle.await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    warn!(device_id = self.device_id(), error = %e, "processing task ended abnormally");
                    None
                }
            },
            None => None,
        };

        // Fresh channel for the next start; whatever is left in the old
        // one is answered here.
        {
            let (tx, rx) = mpsc::channel(self.inner.capacity.max(1));
            *self.inner.command_tx.lock() = tx;
            *self.inner.command_rx.lock() = Some(rx);
        }
        if let Some(mut rx) = receiver {
            rx.close();
            let mut drained = 0usize;
            while let Ok(envelope) = rx.try_recv() {
                drained += 1;
                let CommandEnvelope {
                    mut command,
                    response_tx,
                    permit,
                } = envelope;
                drop(permit);
                command.status = CommandStatus::Cancelled;
                let result = CommandResult::error(
                    ErrorCode::DeviceOffline,
                    "Device stopped before the command was executed",
                );
                let delivered = response_tx.send(result.clone()).is_ok();
                self.inner.log_command(&command, &result, delivered).await;
            }
            if drained > 0 {
                debug!(device_id = self.device_id(), count = drained, "answered queued commands on stop");
            }
        }

        info!(device_id = self.device_id(), "device stopped");
        if let Some(snapshot) = snapshot {
            self.inner.publish_status(snapshot).await;
        }
    }

    /// Supervisor override between ONLINE, BUSY, MAINTENANCE and ERROR.
    pub async fn set_status(&self, status: DeviceStatus) -> Result<(), CoreError> {
        let snapshot = {
            let handles = self.inner.tasks.lock();
            let current = self.inner.status();
            if handles.processor.is_none() {
                return Err(CoreError::NotRunning {
                    device_id: self.device_id().to_owned(),
                });
            }
            if !status.is_override_target() || !current.is_override_target() {
                return Err(CoreError::InvalidTransition {
                    device_id: self.device_id().to_owned(),
                    from: current,
                    to: status,
                });
            }
            self.inner.apply_status(status)
        };
        if let Some(snapshot) = snapshot {
            self.inner.publish_status(snapshot).await;
        }
        Ok(())
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Submit a command and wait for its result, at most `command_timeout`.
    ///
    /// Never fails: every problem is reported as a failed [`CommandResult`].
    /// A command that times out is not cancelled; it still runs and is
    /// logged with `delivered: false`.
    pub async fn execute_command(&self, name: &str, params: Params) -> CommandResult {
        let inner = &self.inner;
        inner.state.lock().stats.commands_received += 1;

        match inner.status() {
            status if status.accepts_commands() => {}
            DeviceStatus::Busy => {
                return inner.reject(name, ErrorCode::DeviceBusy, "Device is busy");
            }
            _ => {
                return inner.reject(name, ErrorCode::DeviceOffline, "Device is offline");
            }
        }

        let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() else {
            return inner.reject(
                name,
                ErrorCode::QueueFull,
                format!("Command queue is full ({} outstanding)", inner.capacity),
            );
        };

        let command = Command::new(CommandKind::parse(name), params);
        let command_id = command.id;
        let (response_tx, response_rx) = oneshot::channel();
        let sender = inner.command_tx.lock().clone();
        if let Err(e) = sender.try_send(CommandEnvelope {
            command,
            response_tx,
            permit,
        }) {
            return match e {
                TrySendError::Full(_) => {
                    inner.reject(name, ErrorCode::QueueFull, "Command queue is full")
                }
                TrySendError::Closed(_) => {
                    inner.reject(name, ErrorCode::DeviceOffline, "Device is offline")
                }
            };
        }
        debug!(device_id = self.device_id(), command = name, %command_id, "command queued");

        match tokio::time::timeout(inner.config.command_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => CommandResult::error(
                ErrorCode::DeviceOffline,
                "Device stopped before the command completed",
            ),
            Err(_) => {
                warn!(device_id = self.device_id(), command = name, %command_id, "command timed out");
                inner.reject(
                    name,
                    ErrorCode::CommandTimeout,
                    format!(
                        "Command '{name}' timed out after {:?}",
                        inner.config.command_timeout
                    ),
                )
            }
        }
    }

    /// Commands accepted but not yet completed.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth()
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.inner.status_snapshot()
    }

    pub fn diagnostics(&self) -> DeviceDiagnostics {
        let inner = &self.inner;
        let status = inner.status();
        let state = inner.state.lock();
        DeviceDiagnostics {
            device_id: inner.config.device_id.clone(),
            device_type: inner.config.device_type.clone(),
            status,
            firmware_version: state.firmware_version.clone(),
            stats: state.stats.clone(),
            error_count: state.error_count,
            recent_errors: state.errors.iter().cloned().collect(),
            queue_depth: inner.queue_depth(),
            attributes: inner.attribute_map(),
            timestamp: Utc::now(),
        }
    }

    pub fn stats(&self) -> DeviceStats {
        self.inner.state.lock().stats.clone()
    }

    pub fn error_count(&self) -> u64 {
        self.inner.state.lock().error_count
    }

    // ── Attributes ───────────────────────────────────────────────────

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.inner.attributes.insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.inner.attributes.get(key).map(|v| v.value().clone())
    }

    pub fn attribute_or(&self, key: &str, default: Value) -> Value {
        self.attribute(key).unwrap_or(default)
    }

    // ── Callbacks ────────────────────────────────────────────────────

    /// Register a callback run on every state transition.
    pub fn on_status_change<F, Fut>(&self, callback: F)
    where
        F: Fn(StatusSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.inner.status_callbacks.register(callback);
    }

    /// Register a callback run after every heartbeat.
    pub fn on_heartbeat<F, Fut>(&self, callback: F)
    where
        F: Fn(HeartbeatSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.inner.heartbeat_callbacks.register(callback);
    }
}

impl Drop for DeviceRuntime {
    fn drop(&mut self) {
        if self.inner.tasks.lock().processor.is_some() {
            debug!(device_id = self.device_id(), "runtime dropped while running, cancelling loops");
        }
        self.inner.cancel.cancel();
        self.inner.status_tx.send_replace(DeviceStatus::Offline);
    }
}

impl RuntimeInner {
    pub(crate) fn status(&self) -> DeviceStatus {
        *self.status_tx.borrow()
    }

    fn queue_depth(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    fn attribute_map(&self) -> Params {
        self.attributes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn status_snapshot(&self) -> StatusSnapshot {
        let status = self.status();
        let now = Utc::now();
        let state = self.state.lock();
        let uptime_secs = state.stats.uptime_start.map_or(0.0, |start| {
            #[allow(clippy::cast_precision_loss)]
            let ms = now.signed_duration_since(start).num_milliseconds().max(0) as f64;
            ms / 1000.0
        });
        StatusSnapshot {
            device_id: self.config.device_id.clone(),
            device_type: self.config.device_type.clone(),
            status,
            firmware_version: state.firmware_version.clone(),
            last_heartbeat: state.last_heartbeat,
            last_command: state.last_command,
            last_status_update: state.last_status_update,
            error_count: state.error_count,
            uptime_secs,
            attributes: self.attribute_map(),
            timestamp: now,
        }
    }

    /// Set the state synchronously. Returns the snapshot to publish when
    /// the state actually changed.
    pub(crate) fn apply_status(&self, to: DeviceStatus) -> Option<StatusSnapshot> {
        let from = self.status_tx.send_replace(to);
        if from == to {
            return None;
        }
        self.state.lock().last_status_update = Some(Utc::now());
        info!(device_id = %self.config.device_id, %from, %to, "device status changed");
        Some(self.status_snapshot())
    }

    /// Like [`apply_status`](Self::apply_status), but refused once `cancel`
    /// fired. Serialized with `stop()` through the task lock.
    pub(crate) fn apply_status_if_active(
        &self,
        to: DeviceStatus,
        cancel: &CancellationToken,
    ) -> Result<Option<StatusSnapshot>, ()> {
        let _tasks = self.tasks.lock();
        if cancel.is_cancelled() {
            return Err(());
        }
        Ok(self.apply_status(to))
    }

    /// Persist a status snapshot and notify status subscribers.
    pub(crate) async fn publish_status(&self, snapshot: StatusSnapshot) {
        if self.config.enable_logging {
            if let Some(telemetry) = &self.telemetry {
                telemetry
                    .add(TelemetryRecord::new(
                        self.config.device_id.as_str(),
                        RecordKind::Status,
                        to_payload(&snapshot),
                    ))
                    .await;
            }
        }
        self.status_callbacks
            .notify(&self.config.device_id, &snapshot)
            .await;
    }

    /// Account for a command refused before execution.
    fn reject(&self, command: &str, code: ErrorCode, message: impl Into<String>) -> CommandResult {
        {
            let mut state = self.state.lock();
            state.stats.errors += 1;
            state.error_count += 1;
        }
        let message = message.into();
        debug!(device_id = %self.config.device_id, command, %code, %message, "command rejected");
        CommandResult::error(code, message)
    }

    /// Append to the error ring and bump both error counters.
    pub(crate) fn record_error(&self, command: Option<&str>, message: &str) {
        let mut state = self.state.lock();
        state.errors.record(command, message);
        state.error_count += 1;
        state.stats.errors += 1;
    }
}
