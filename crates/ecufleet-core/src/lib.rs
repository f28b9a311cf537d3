//! Runtime engine and telemetry batching for simulated ECU fleets.
//!
//! This crate owns the per-device runtime and the persistence buffering
//! layer that sits between device runtimes and a telemetry store:
//!
//! - **[`DeviceRuntime`]**: One instance per managed device. Owns the
//!   state machine, a bounded FIFO command queue, a background command
//!   processor and a heartbeat loop. [`start()`](DeviceRuntime::start)
//!   spawns both loops, [`stop()`](DeviceRuntime::stop) cancels and joins
//!   them. Dropping the runtime cancels anything still running.
//!
//! - **[`BatchWriter`] / [`PriorityBatchWriter`]**: Per-kind buffers for
//!   status snapshots, heartbeats, command logs, domain events and usage
//!   records. Flushed to a [`TelemetrySink`] when a size threshold is hit
//!   or a periodic timer fires.
//!
//! - **[`DeviceRegistry`]**: Explicit registry of device types (factory,
//!   category, config template) and live runtimes. Passed by handle, never
//!   global.
//!
//! - **Device behavior** ([`device`]): The [`Lockable`] and
//!   [`StatusReporting`] capabilities a device type implements. Generic
//!   commands (config update, reboot, firmware update) live in the runtime.

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod registry;
pub mod runtime;
pub mod telemetry;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::{Command, CommandKind, CommandResult, CommandStatus, Params};
pub use config::{BatchWriterConfig, DeviceConfig, KindPolicy};
pub use device::{DeviceBehavior, DeviceContext, DoorAccess, Lockable, SharedBike, StatusReporting};
pub use error::{CommandError, CoreError, ErrorCode, HandlerResult, SinkError};
pub use model::{
    DeviceDiagnostics, DeviceStats, DeviceStatus, ErrorEntry, ErrorRing, HeartbeatSnapshot,
    StatusSnapshot,
};
pub use registry::{
    ConfigTemplate, DeviceCategory, DeviceRegistry, DeviceSummary, DeviceTypeEntry,
};
pub use runtime::{CallbackError, DeviceRuntime};
pub use telemetry::{
    BatchWriter, MemorySink, Priority, PriorityBatchWriter, RecordKind, TelemetryBuffer,
    TelemetryRecord, TelemetrySink, WriterStats,
};
