// ── Command dispatch ──
//
// Lock / unlock / get-status and unknown names go to the device
// behavior. Config update, reboot and firmware update are implemented
// here once for every device type.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{RuntimeInner, tasks};
use crate::command::{Command, CommandKind, Params, f64_param, params, str_param};
use crate::error::{CommandError, ErrorCode, HandlerResult};
use crate::model::DeviceStatus;

impl RuntimeInner {
    pub(super) async fn dispatch(
        self: &Arc<Self>,
        command: &Command,
        cancel: &CancellationToken,
    ) -> HandlerResult {
        let ctx = &self.ctx;
        let args = &command.params;
        match &command.kind {
            CommandKind::Lock => self.behavior.lock(ctx, args).await,
            CommandKind::Unlock => self.behavior.unlock(ctx, args).await,
            CommandKind::GetStatus => {
                let result = self.behavior.get_status(ctx, args).await;
                if result.is_ok() {
                    self.state.lock().last_status_update = Some(Utc::now());
                }
                result
            }
            CommandKind::UpdateConfig => self.update_config(args),
            CommandKind::Reboot => self.reboot(args, cancel).await,
            CommandKind::FirmwareUpdate => self.firmware_update(args, cancel).await,
            CommandKind::Custom(name) => self.behavior.custom_command(ctx, name, args).await,
        }
    }

    /// Merge `params.config` into the attribute store.
    fn update_config(&self, args: &Params) -> HandlerResult {
        let Some(config) = args.get("config").and_then(Value::as_object) else {
            return Err(CommandError::invalid_params(
                "'config' must be an object of attribute updates",
            ));
        };
        let mut updated: Vec<&str> = Vec::with_capacity(config.len());
        for (key, value) in config {
            self.attributes.insert(key.clone(), value.clone());
            updated.push(key.as_str());
        }
        info!(device_id = %self.config.device_id, count = updated.len(), "configuration updated");
        Ok(params([
            ("message", json!("Configuration updated")),
            ("updated_keys", json!(updated)),
        ]))
    }

    /// OFFLINE, wait, ONLINE again with a fresh heartbeat loop.
    ///
    /// Runs on the processing task, so the processor itself keeps going;
    /// only the heartbeat loop is stopped and respawned.
    async fn reboot(self: &Arc<Self>, args: &Params, cancel: &CancellationToken) -> HandlerResult {
        let delay = match f64_param(args, "delay") {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Duration::from_secs_f64(secs),
            Some(_) => return Err(CommandError::invalid_params("'delay' must be non-negative")),
            None => self.config.reboot_delay,
        };
        info!(device_id = %self.config.device_id, delay_ms = delay.as_millis(), "rebooting device");

        let interrupted = || {
            CommandError::new(ErrorCode::DeviceOffline, "Reboot interrupted: device stopped")
        };

        let Ok(snapshot) = self.apply_status_if_active(DeviceStatus::Offline, cancel) else {
            return Err(interrupted());
        };
        if let Some(snapshot) = snapshot {
            self.publish_status(snapshot).await;
        }

        let heartbeat = self.tasks.lock().heartbeat.take();
        if let Some(handle) = heartbeat {
            if let Err(e) = handle.await {
                warn!(device_id = %self.config.device_id, error = %e, "heartbeat task ended abnormally");
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(interrupted()),
            () = tokio::time::sleep(delay) => {}
        }

        let snapshot = {
            let mut handles = self.tasks.lock();
            if cancel.is_cancelled() {
                return Err(interrupted());
            }
            self.state.lock().stats.uptime_start = Some(Utc::now());
            let snapshot = self.apply_status(DeviceStatus::Online);
            handles.heartbeat = Some(tokio::spawn(tasks::heartbeat_loop(
                Arc::clone(self),
                cancel.clone(),
            )));
            snapshot
        };
        if let Some(snapshot) = snapshot {
            self.publish_status(snapshot).await;
        }

        info!(device_id = %self.config.device_id, "device rebooted");
        Ok(params([
            ("message", json!("Device rebooted")),
            ("delay_secs", json!(delay.as_secs_f64())),
        ]))
    }

    /// UPDATING, simulated install, new version and back to ONLINE.
    /// Failure leaves the device in ERROR.
    async fn firmware_update(&self, args: &Params, cancel: &CancellationToken) -> HandlerResult {
        let Some(version) = str_param(args, "version")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
        else {
            return Err(self.fail_firmware(cancel, "Firmware version is required").await);
        };
        let previous = self.state.lock().firmware_version.clone();
        info!(device_id = %self.config.device_id, from = %previous, to = %version, "firmware update started");

        match self.apply_status_if_active(DeviceStatus::Updating, cancel) {
            Ok(Some(snapshot)) => self.publish_status(snapshot).await,
            Ok(None) => {}
            Err(()) => {
                return Err(CommandError::new(ErrorCode::FirmwareError, "Device stopped"));
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(self.fail_firmware(cancel, "Firmware update interrupted").await);
            }
            () = tokio::time::sleep(self.config.firmware_update_duration) => {}
        }

        self.state.lock().firmware_version.clone_from(&version);
        match self.apply_status_if_active(DeviceStatus::Online, cancel) {
            Ok(Some(snapshot)) => self.publish_status(snapshot).await,
            Ok(None) => {}
            Err(()) => {
                return Err(self.fail_firmware(cancel, "Firmware update interrupted").await);
            }
        }

        info!(device_id = %self.config.device_id, version = %version, "firmware update completed");
        Ok(params([
            ("message", json!("Firmware updated")),
            ("previous_version", json!(previous)),
            ("firmware_version", json!(version)),
        ]))
    }

    /// Record a firmware failure and enter ERROR, unless the device is
    /// being stopped.
    async fn fail_firmware(&self, cancel: &CancellationToken, message: &str) -> CommandError {
        warn!(device_id = %self.config.device_id, %message, "firmware update failed");
        self.record_error(Some("firmware_update"), message);
        if let Ok(Some(snapshot)) = self.apply_status_if_active(DeviceStatus::Error, cancel) {
            self.publish_status(snapshot).await;
        }
        CommandError::new(ErrorCode::FirmwareError, message)
    }
}
