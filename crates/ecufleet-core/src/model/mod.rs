// ── Domain model ──
//
// State, statistics, error history and the snapshot views exposed by a
// device runtime.

mod error_ring;
mod snapshot;
mod stats;
mod status;

pub use error_ring::{ErrorEntry, ErrorRing};
pub use snapshot::{DeviceDiagnostics, HeartbeatSnapshot, StatusSnapshot};
pub(crate) use snapshot::to_payload;
pub use stats::DeviceStats;
pub use status::DeviceStatus;
