// ── Telemetry records, sinks and batch buffering ──
//
// Device runtimes produce `TelemetryRecord`s into a `TelemetryBuffer`.
// The two buffer implementations (`BatchWriter`, `PriorityBatchWriter`)
// aggregate records per kind and hand them to a `TelemetrySink` in bulk.

mod batch;
mod priority;
mod sink;
mod timer;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::command::Params;
use crate::error::SinkError;

pub use batch::BatchWriter;
pub use priority::{Priority, PriorityBatchWriter};
pub use sink::MemorySink;

/// The five persisted telemetry kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordKind {
    Status,
    Heartbeat,
    CommandLog,
    Event,
    Usage,
}

impl RecordKind {
    /// Order in which kinds are flushed on every timer tick.
    pub const FLUSH_ORDER: [Self; 5] = [
        Self::Status,
        Self::Heartbeat,
        Self::CommandLog,
        Self::Event,
        Self::Usage,
    ];
}

/// An immutable unit of telemetry destined for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: Uuid,
    pub device_id: String,
    pub kind: RecordKind,
    pub payload: Params,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn new(device_id: impl Into<String>, kind: RecordKind, payload: Params) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Persistence target for batched telemetry.
///
/// Must be safe to call concurrently for different kinds.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn insert_many(
        &self,
        kind: RecordKind,
        records: &[TelemetryRecord],
    ) -> Result<(), SinkError>;
}

/// Where producers put telemetry. `add` never fails: downstream
/// persistence problems are the buffer's concern.
#[async_trait]
pub trait TelemetryBuffer: Send + Sync {
    async fn add(&self, record: TelemetryRecord);
}

/// Counters kept by both batch writers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterStats {
    pub total_written: u64,
    pub written_by_kind: BTreeMap<RecordKind, u64>,
    pub batch_operations: u64,
    pub failed_flushes: u64,
    pub dropped_records: u64,
    /// Priority writer only: records put back after a failed flush.
    pub requeued_records: u64,
    pub last_flush_time: Option<DateTime<Utc>>,
}

impl WriterStats {
    pub(crate) fn record_success(&mut self, kind: RecordKind, count: usize) {
        let count = count as u64;
        self.total_written += count;
        *self.written_by_kind.entry(kind).or_default() += count;
        self.batch_operations += 1;
        self.last_flush_time = Some(Utc::now());
    }

    pub fn written(&self, kind: RecordKind) -> u64 {
        self.written_by_kind.get(&kind).copied().unwrap_or(0)
    }
}
