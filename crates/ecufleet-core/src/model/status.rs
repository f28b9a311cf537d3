// ── Device operational state ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Operational state of a device runtime.
///
/// OFFLINE is the initial state and the only valid state while no
/// background loops are running.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Offline,
    Online,
    Error,
    Updating,
    Maintenance,
    Busy,
}

impl DeviceStatus {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }

    /// Whether commands may be queued in this state.
    pub fn accepts_commands(self) -> bool {
        !matches!(self, Self::Offline | Self::Busy)
    }

    /// Targets reachable through a supervisor status override.
    pub fn is_override_target(self) -> bool {
        matches!(
            self,
            Self::Online | Self::Busy | Self::Maintenance | Self::Error
        )
    }
}
