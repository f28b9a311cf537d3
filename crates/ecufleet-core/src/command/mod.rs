// ── Command API ──
//
// Every unit of work submitted to a device runtime is a `Command`.
// `CommandKind` is the typed dispatch key: known kinds route to the
// device behavior or a runtime-level handler, everything else falls
// through to the behavior's `custom_command`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use strum::EnumString;
use tokio::sync::{OwnedSemaphorePermit, oneshot};
use uuid::Uuid;

use crate::error::{CommandError, ErrorCode, HandlerResult};

/// Command parameters and result payloads.
pub type Params = Map<String, Value>;

/// A command envelope sent through the device's command channel.
///
/// The permit is released when the envelope is dropped, which happens
/// only after the command finished executing.
pub(crate) struct CommandEnvelope {
    pub command: Command,
    pub response_tx: oneshot::Sender<CommandResult>,
    pub permit: OwnedSemaphorePermit,
}

/// Typed command name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CommandKind {
    Lock,
    Unlock,
    GetStatus,
    UpdateConfig,
    Reboot,
    FirmwareUpdate,
    /// Any other name; routed to the device behavior's fallback.
    #[strum(default)]
    Custom(String),
}

impl CommandKind {
    pub fn parse(name: &str) -> Self {
        // `#[strum(default)]` makes this infallible.
        Self::from_str(name).unwrap_or_else(|_| Self::Custom(name.to_owned()))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::GetStatus => "get_status",
            Self::UpdateConfig => "update_config",
            Self::Reboot => "reboot",
            Self::FirmwareUpdate => "firmware_update",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for CommandKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for CommandKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name))
    }
}

/// Lifecycle tag of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Executing,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

/// A submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub kind: CommandKind,
    pub params: Params,
    pub submitted_at: DateTime<Utc>,
    pub status: CommandStatus,
}

impl Command {
    pub fn new(kind: CommandKind, params: Params) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            params,
            submitted_at: Utc::now(),
            status: CommandStatus::Pending,
        }
    }
}

/// Structured outcome of one command. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub data: Params,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    pub fn ok(data: Params) -> Self {
        Self {
            success: true,
            data,
            error_code: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(error: CommandError) -> Self {
        Self {
            success: false,
            data: Params::new(),
            error_code: Some(error.code),
            error_message: Some(error.message),
            timestamp: Utc::now(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failure(CommandError::new(code, message))
    }

    pub fn from_handler(result: HandlerResult) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failure(e),
        }
    }

    /// Numeric wire code of the error, if any.
    pub fn code(&self) -> Option<i32> {
        self.error_code.map(ErrorCode::code)
    }
}

// ── Parameter helpers ────────────────────────────────────────────────

pub fn str_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

pub fn f64_param(params: &Params, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}

/// Build a `Params` map from `(key, value)` pairs.
pub fn params<I, K>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
