// ── Runtime configuration records ──
//
// Plain data handed to `DeviceRuntime::new` and `BatchWriter::new`.
// The core never reads config files; `ecufleet-config` builds these.

use std::collections::HashMap;
use std::time::Duration;

use crate::telemetry::RecordKind;

/// Configuration for a single device runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Stable device identifier (e.g., `"bike-0042"`).
    pub device_id: String,
    /// Device-type tag used for registry lookup (e.g., `"shared_bike"`).
    pub device_type: String,
    pub firmware_version: String,
    /// Time between heartbeats while ONLINE.
    pub heartbeat_interval: Duration,
    /// How long a caller waits for a command result.
    pub command_timeout: Duration,
    /// Maximum number of accepted-but-unfinished commands.
    pub max_command_queue: usize,
    /// Reserved for reconnection logic; not used by the runtime.
    pub reconnect_attempts: u32,
    /// Reserved for reconnection logic; not used by the runtime.
    pub reconnect_delay: Duration,
    /// Hand status, heartbeat and command-log records to the telemetry buffer.
    pub enable_logging: bool,
    /// Default pause between stop and start during `reboot`.
    pub reboot_delay: Duration,
    /// Simulated duration of a firmware download + install.
    pub firmware_update_duration: Duration,
    /// Capacity of the recent-error ring buffer.
    pub error_history: usize,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            firmware_version: "1.0.0".into(),
            heartbeat_interval: Duration::from_secs(30),
            command_timeout: Duration::from_secs(10),
            max_command_queue: 100,
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
            enable_logging: true,
            reboot_delay: Duration::from_secs(3),
            firmware_update_duration: Duration::from_secs(8),
            error_history: 100,
        }
    }
}

/// Flush policy for one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    /// Buffer length that triggers an immediate flush.
    pub batch_size: usize,
}

/// Configuration shared by [`BatchWriter`](crate::BatchWriter) and
/// [`PriorityBatchWriter`](crate::PriorityBatchWriter).
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriterConfig {
    pub batch_size: usize,
    /// Period of the shared flush timer. Every tick flushes every
    /// non-empty kind.
    pub flush_interval: Duration,
    /// Per-kind overrides of `batch_size`.
    pub overrides: HashMap<RecordKind, KindPolicy>,
    /// Priority writer only: flush attempts before an entry is dropped.
    pub max_flush_attempts: u32,
}

impl BatchWriterConfig {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            batch_size,
            flush_interval,
            overrides: HashMap::new(),
            max_flush_attempts: 3,
        }
    }

    pub fn with_policy(mut self, kind: RecordKind, policy: KindPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    /// Effective policy for `kind`.
    pub fn policy(&self, kind: RecordKind) -> KindPolicy {
        self.overrides.get(&kind).copied().unwrap_or(KindPolicy {
            batch_size: self.batch_size,
        })
    }

    pub(crate) fn tick_period(&self) -> Duration {
        self.flush_interval.max(Duration::from_millis(1))
    }
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(5))
    }
}
