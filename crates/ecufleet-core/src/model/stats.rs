// ── Per-device statistics ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters maintained by a device runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub commands_received: u64,
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub heartbeats_sent: u64,
    pub errors: u64,
    /// Set on each `start()`; `None` while the device has never run.
    pub uptime_start: Option<DateTime<Utc>>,
    /// Seconds since `uptime_start`, recomputed on every heartbeat.
    pub total_uptime_secs: f64,
    pub last_reset: DateTime<Utc>,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self {
            commands_received: 0,
            commands_executed: 0,
            commands_failed: 0,
            heartbeats_sent: 0,
            errors: 0,
            uptime_start: None,
            total_uptime_secs: 0.0,
            last_reset: Utc::now(),
        }
    }

    pub(crate) fn refresh_uptime(&mut self, now: DateTime<Utc>) {
        if let Some(start) = self.uptime_start {
            let elapsed = now.signed_duration_since(start);
            #[allow(clippy::cast_precision_loss)]
            {
                self.total_uptime_secs = elapsed.num_milliseconds().max(0) as f64 / 1000.0;
            }
        }
    }
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self::new()
    }
}
