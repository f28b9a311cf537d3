// ── Read-only views of a device runtime ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error_ring::ErrorEntry;
use super::stats::DeviceStats;
use super::status::DeviceStatus;

/// Full status view, handed to status callbacks and persisted on every
/// state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub device_type: String,
    pub status: DeviceStatus,
    pub firmware_version: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_command: Option<DateTime<Utc>>,
    pub last_status_update: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub uptime_secs: f64,
    pub attributes: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Payload of one heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub device_id: String,
    pub status: DeviceStatus,
    pub uptime_secs: f64,
    pub stats: DeviceStats,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDiagnostics {
    pub device_id: String,
    pub device_type: String,
    pub status: DeviceStatus,
    pub firmware_version: String,
    pub stats: DeviceStats,
    pub error_count: u64,
    pub recent_errors: Vec<ErrorEntry>,
    /// Commands accepted but not yet completed.
    pub queue_depth: usize,
    pub attributes: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Serialize a view into a telemetry payload map.
pub(crate) fn to_payload<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
