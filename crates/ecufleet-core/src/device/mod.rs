// ── Device-type behavior ──
//
// A device type supplies the lock / unlock / get-status capabilities and
// optionally a fallback for commands the runtime does not know. Generic
// operations (config update, reboot, firmware update) live in the
// runtime and are never overridden per type.

mod bike;
mod door;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::command::Params;
use crate::error::{CommandError, HandlerResult};
use crate::telemetry::{RecordKind, TelemetryBuffer, TelemetryRecord};

pub use bike::SharedBike;
pub use door::DoorAccess;

/// Handle given to behavior methods: the device's identity, its
/// attribute store and a telemetry outlet for domain events.
#[derive(Clone)]
pub struct DeviceContext {
    device_id: Arc<str>,
    attributes: Arc<DashMap<String, Value>>,
    telemetry: Option<Arc<dyn TelemetryBuffer>>,
}

impl DeviceContext {
    pub fn new(
        device_id: impl Into<Arc<str>>,
        attributes: Arc<DashMap<String, Value>>,
        telemetry: Option<Arc<dyn TelemetryBuffer>>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            attributes,
            telemetry,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.get(key).map(|v| v.value().clone())
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn bool_attribute(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(|v| v.value().as_bool())
    }

    pub fn f64_attribute(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(|v| v.value().as_f64())
    }

    pub fn str_attribute(&self, key: &str) -> Option<String> {
        self.attributes
            .get(key)
            .and_then(|v| v.value().as_str().map(str::to_owned))
    }

    /// Record a domain event. `event_type` is added to the payload.
    pub async fn emit_event(&self, event_type: &str, mut payload: Params) {
        payload.insert("event_type".into(), Value::String(event_type.to_owned()));
        self.emit(RecordKind::Event, payload).await;
    }

    /// Record a usage (ride / session) record.
    pub async fn emit_usage(&self, payload: Params) {
        self.emit(RecordKind::Usage, payload).await;
    }

    async fn emit(&self, kind: RecordKind, payload: Params) {
        if let Some(telemetry) = &self.telemetry {
            telemetry
                .add(TelemetryRecord::new(self.device_id.as_ref(), kind, payload))
                .await;
        }
    }
}

#[async_trait]
pub trait Lockable: Send + Sync {
    async fn lock(&self, ctx: &DeviceContext, params: &Params) -> HandlerResult;
    async fn unlock(&self, ctx: &DeviceContext, params: &Params) -> HandlerResult;
}

#[async_trait]
pub trait StatusReporting: Send + Sync {
    async fn get_status(&self, ctx: &DeviceContext, params: &Params) -> HandlerResult;
}

/// Full behavior of a device type.
#[async_trait]
pub trait DeviceBehavior: Lockable + StatusReporting {
    /// Attributes seeded into the runtime at construction.
    fn initial_attributes(&self) -> Params {
        Params::new()
    }

    /// Handler for command names the runtime does not dispatch itself.
    async fn custom_command(
        &self,
        _ctx: &DeviceContext,
        name: &str,
        _params: &Params,
    ) -> HandlerResult {
        Err(CommandError::method_not_found(name))
    }
}

// ── Shared helpers for the simulated types ──────────────────────────

pub(crate) fn bool_param(params: &Params, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn string_param(params: &Params, key: &str, default: &str) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_owned()
}

/// Lock mechanism condition, kept in the `lock_status` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum LockMechanism {
    Normal,
    Stuck,
    Broken,
}

impl LockMechanism {
    pub(crate) fn from_attribute(ctx: &DeviceContext, key: &str) -> Self {
        ctx.str_attribute(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Self::Normal)
    }
}
