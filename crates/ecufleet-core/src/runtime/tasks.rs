// ── Background tasks ──
//
// `process_commands` is the single consumer of the command channel and
// hands its receiver back when it exits. `heartbeat_loop` emits
// heartbeats while the device is ONLINE.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{POLL_INTERVAL, RuntimeInner};
use crate::command::{Command, CommandEnvelope, CommandResult, CommandStatus};
use crate::error::CommandError;
use crate::model::{DeviceStatus, HeartbeatSnapshot, to_payload};
use crate::telemetry::{RecordKind, TelemetryRecord};

pub(super) async fn process_commands(
    inner: Arc<RuntimeInner>,
    mut rx: mpsc::Receiver<CommandEnvelope>,
    cancel: CancellationToken,
) -> mpsc::Receiver<CommandEnvelope> {
    let device_id = inner.config.device_id.clone();
    debug!(%device_id, "command processor started");

    loop {
        if inner.status() == DeviceStatus::Offline {
            break;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = tokio::time::timeout(POLL_INTERVAL, rx.recv()) => match next {
                Ok(Some(envelope)) => inner.run_envelope(envelope, &cancel).await,
                Ok(None) => break,
                Err(_) => {}
            },
        }
    }

    debug!(%device_id, "command processor stopped");
    rx
}

pub(super) async fn heartbeat_loop(inner: Arc<RuntimeInner>, cancel: CancellationToken) {
    let device_id = inner.config.device_id.clone();
    let mut status_rx = inner.status_tx.subscribe();
    let mut interval = tokio::time::interval(inner.config.heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        if *status_rx.borrow_and_update() == DeviceStatus::Offline {
            break;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = interval.tick() => {
                if inner.status().is_online() {
                    inner.send_heartbeat().await;
                }
            }
        }
    }

    debug!(%device_id, "heartbeat loop stopped");
}

impl RuntimeInner {
    /// Execute one dequeued command, answer its caller and log it.
    async fn run_envelope(self: &Arc<Self>, envelope: CommandEnvelope, cancel: &CancellationToken) {
        let CommandEnvelope {
            mut command,
            response_tx,
            permit,
        } = envelope;
        command.status = CommandStatus::Executing;
        let name = command.kind.name().to_owned();
        debug!(device_id = %self.config.device_id, command = %name, id = %command.id, "executing command");

        let outcome = AssertUnwindSafe(self.dispatch(&command, cancel))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(handled) => CommandResult::from_handler(handled),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(device_id = %self.config.device_id, command = %name, %message, "command handler panicked");
                self.record_error(Some(&name), &message);
                CommandResult::failure(CommandError::internal(format!(
                    "Command '{name}' failed: {message}"
                )))
            }
        };

        {
            let mut state = self.state.lock();
            state.last_command = Some(Utc::now());
            if result.success {
                state.stats.commands_executed += 1;
            } else {
                state.stats.commands_failed += 1;
            }
        }

        let delivered = response_tx.send(result.clone()).is_ok();
        drop(permit);

        command.status = match (delivered, result.success) {
            (false, _) => CommandStatus::Timeout,
            (true, true) => CommandStatus::Success,
            (true, false) => CommandStatus::Failed,
        };
        if !delivered {
            debug!(device_id = %self.config.device_id, command = %name, "caller gone before result was ready");
        }
        self.log_command(&command, &result, delivered).await;
    }

    pub(super) async fn log_command(&self, command: &Command, result: &CommandResult, delivered: bool) {
        if !self.config.enable_logging {
            return;
        }
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let payload = crate::command::params([
            ("command_id", json!(command.id)),
            ("command", json!(command.kind.name())),
            ("params", Value::Object(command.params.clone())),
            ("submitted_at", json!(command.submitted_at)),
            ("status", json!(command.status)),
            ("success", json!(result.success)),
            ("delivered", json!(delivered)),
            ("result", json!(result)),
        ]);
        telemetry
            .add(TelemetryRecord::new(
                self.config.device_id.as_str(),
                RecordKind::CommandLog,
                payload,
            ))
            .await;
    }

    async fn send_heartbeat(&self) {
        let now = Utc::now();
        let snapshot = {
            let mut state = self.state.lock();
            state.last_heartbeat = Some(now);
            state.stats.heartbeats_sent += 1;
            state.stats.refresh_uptime(now);
            HeartbeatSnapshot {
                device_id: self.config.device_id.clone(),
                status: self.status(),
                uptime_secs: state.stats.total_uptime_secs,
                stats: state.stats.clone(),
                timestamp: now,
            }
        };

        if self.config.enable_logging {
            if let Some(telemetry) = &self.telemetry {
                telemetry
                    .add(TelemetryRecord::new(
                        self.config.device_id.as_str(),
                        RecordKind::Heartbeat,
                        to_payload(&snapshot),
                    ))
                    .await;
            }
        }
        self.heartbeat_callbacks
            .notify(&self.config.device_id, &snapshot)
            .await;
        debug!(device_id = %self.config.device_id, beats = snapshot.stats.heartbeats_sent, "heartbeat sent");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}
