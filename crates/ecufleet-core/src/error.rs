// ── Core error types ──
//
// Two layers: `CommandError` / `ErrorCode` travel inside a failed
// `CommandResult` and never escape `execute_command`. `CoreError` covers
// the non-command surface (registry, status overrides). `SinkError` is
// what a telemetry sink reports; producers never see it.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

use crate::model::DeviceStatus;

/// Outcome of a command handler: a payload map on success.
pub type HandlerResult = Result<crate::command::Params, CommandError>;

/// Command-level error taxonomy, with JSON-RPC style numeric codes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MethodNotFound,
    InvalidParams,
    InternalError,
    DeviceOffline,
    DeviceBusy,
    PermissionDenied,
    CommandTimeout,
    InvalidState,
    ResourceUnavailable,
    FirmwareError,
    QueueFull,
}

impl ErrorCode {
    /// Numeric code as carried on the supervisor wire envelope.
    pub const fn code(self) -> i32 {
        match self {
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::DeviceOffline => -32001,
            Self::DeviceBusy => -32002,
            Self::PermissionDenied => -32003,
            Self::CommandTimeout => -32004,
            Self::InvalidState => -32005,
            Self::ResourceUnavailable => -32007,
            Self::FirmwareError => -32009,
            Self::QueueFull => -32010,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            Self::MethodNotFound,
            Self::InvalidParams,
            Self::InternalError,
            Self::DeviceOffline,
            Self::DeviceBusy,
            Self::PermissionDenied,
            Self::CommandTimeout,
            Self::InvalidState,
            Self::ResourceUnavailable,
            Self::FirmwareError,
            Self::QueueFull,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

/// A failed command outcome produced by a handler or the runtime itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(command: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Command '{command}' not supported"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceUnavailable, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

/// Unified error type for non-command operations of the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Registry errors ──────────────────────────────────────────────
    #[error("Unknown device type: {device_type}")]
    UnknownDeviceType { device_type: String },

    #[error("Device already registered: {device_id}")]
    DuplicateDevice { device_id: String },

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Device {device_id} is not running")]
    NotRunning { device_id: String },

    #[error("Invalid status transition for {device_id}: {from} -> {to}")]
    InvalidTransition {
        device_id: String,
        from: DeviceStatus,
        to: DeviceStatus,
    },
}

/// Failure reported by a [`TelemetrySink`](crate::telemetry::TelemetrySink).
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("insert rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_through_numeric_form() {
        for code in [ErrorCode::DeviceOffline, ErrorCode::QueueFull, ErrorCode::MethodNotFound] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
    }

    #[test]
    fn error_code_display_matches_wire_name() {
        assert_eq!(ErrorCode::CommandTimeout.to_string(), "COMMAND_TIMEOUT");
        assert_eq!(
            "DEVICE_BUSY".parse::<ErrorCode>().ok(),
            Some(ErrorCode::DeviceBusy)
        );
    }

    #[test]
    fn command_error_formats_code_and_message() {
        let err = CommandError::method_not_found("self_destruct");
        assert_eq!(
            err.to_string(),
            "METHOD_NOT_FOUND: Command 'self_destruct' not supported"
        );
    }
}
