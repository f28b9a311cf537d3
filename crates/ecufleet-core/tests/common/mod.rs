#![allow(dead_code, clippy::unwrap_used)]
// Shared fixtures for the runtime and registry integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use ecufleet_core::command::params;
use ecufleet_core::{
    CallbackError, CommandError, DeviceBehavior, DeviceConfig, DeviceContext, DeviceRuntime,
    DeviceStatus, HandlerResult, Lockable, Params, RecordKind, StatusReporting, TelemetryBuffer,
    TelemetryRecord,
};

// ── Recording device ────────────────────────────────────────────────

/// Behavior that records the order of every command it sees.
///
/// Custom commands: `echo` returns its params, `slow` sleeps `ms`
/// milliseconds (default 1000), `panic` panics, `fail` returns
/// INVALID_STATE.
#[derive(Default)]
pub struct RecordingDevice {
    pub seen: Mutex<Vec<String>>,
}

impl RecordingDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    fn note(&self, name: &str, args: &Params) {
        let entry = match args.get("n") {
            Some(n) => format!("{name}:{n}"),
            None => name.to_owned(),
        };
        self.seen.lock().push(entry);
    }
}

#[async_trait]
impl Lockable for RecordingDevice {
    async fn lock(&self, ctx: &DeviceContext, args: &Params) -> HandlerResult {
        self.note("lock", args);
        ctx.set_attribute("is_locked", json!(true));
        Ok(params([("locked", json!(true))]))
    }

    async fn unlock(&self, ctx: &DeviceContext, args: &Params) -> HandlerResult {
        self.note("unlock", args);
        ctx.set_attribute("is_locked", json!(false));
        Ok(params([("locked", json!(false))]))
    }
}

#[async_trait]
impl StatusReporting for RecordingDevice {
    async fn get_status(&self, ctx: &DeviceContext, args: &Params) -> HandlerResult {
        self.note("get_status", args);
        Ok(params([("device_id", json!(ctx.device_id()))]))
    }
}

#[async_trait]
impl DeviceBehavior for RecordingDevice {
    fn initial_attributes(&self) -> Params {
        params([("is_locked", json!(true))])
    }

    async fn custom_command(&self, _ctx: &DeviceContext, name: &str, args: &Params) -> HandlerResult {
        self.note(name, args);
        match name {
            "echo" => Ok(args.clone()),
            "slow" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(params([("slept_ms", json!(ms))]))
            }
            "panic" => panic!("simulated handler fault"),
            "fail" => Err(CommandError::invalid_state("simulated failure")),
            other => Err(CommandError::method_not_found(other)),
        }
    }
}

// ── Collecting telemetry buffer ─────────────────────────────────────

/// Buffer that keeps every record it is handed.
#[derive(Default)]
pub struct CollectingBuffer {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl CollectingBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn of_kind(&self, kind: RecordKind) -> Vec<TelemetryRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TelemetryBuffer for CollectingBuffer {
    async fn add(&self, record: TelemetryRecord) {
        self.records.lock().push(record);
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

pub fn test_config(device_id: &str) -> DeviceConfig {
    let mut config = DeviceConfig::new(device_id, "recording");
    config.heartbeat_interval = Duration::from_secs(1);
    config.command_timeout = Duration::from_secs(5);
    config.max_command_queue = 10;
    config.reboot_delay = Duration::from_secs(1);
    config.firmware_update_duration = Duration::from_secs(2);
    config
}

pub fn runtime_with(
    config: DeviceConfig,
) -> (DeviceRuntime, Arc<RecordingDevice>, Arc<CollectingBuffer>) {
    let device = RecordingDevice::new();
    let buffer = CollectingBuffer::new();
    let telemetry: Arc<dyn TelemetryBuffer> = buffer.clone();
    let runtime = DeviceRuntime::new(config, device.clone(), Some(telemetry));
    (runtime, device, buffer)
}

/// Count heartbeats through a registered callback.
pub fn count_heartbeats(runtime: &DeviceRuntime) -> Arc<AtomicUsize> {
    let beats = Arc::new(AtomicUsize::new(0));
    let counter = beats.clone();
    runtime.on_heartbeat(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<(), CallbackError>(()) }
    });
    beats
}

/// Record every published state through a registered callback.
pub fn record_statuses(runtime: &DeviceRuntime) -> Arc<Mutex<Vec<DeviceStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    runtime.on_status_change(move |snapshot| {
        sink.lock().push(snapshot.status);
        async { Ok::<(), CallbackError>(()) }
    });
    seen
}
