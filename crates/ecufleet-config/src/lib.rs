//! Fleet configuration for hosts embedding `ecufleet-core`.
//!
//! TOML file + `ECUFLEET_` environment overrides, merged with figment and
//! translated into `ecufleet_core::DeviceConfig` / `BatchWriterConfig`.
//! Also hosts the tracing subscriber setup ([`init_tracing`]).

mod logging;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ecufleet_core::{
    BatchWriterConfig, CoreError, DeviceCategory, DeviceConfig, DeviceRegistry, DeviceRuntime,
    KindPolicy, RecordKind,
};

pub use logging::{LogGuard, init_tracing};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("device setup failed: {0}")]
    Core(#[from] CoreError),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level fleet configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FleetConfig {
    /// Defaults applied to every device before type and entry overrides.
    #[serde(default)]
    pub runtime: RuntimeDefaults,

    #[serde(default)]
    pub batch: BatchSection,

    /// Per-type templates keyed by device-type tag.
    #[serde(default)]
    pub device_types: BTreeMap<String, DeviceTypeSection>,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let mut device_types = BTreeMap::new();
        device_types.insert(
            "shared_bike".to_owned(),
            DeviceTypeSection {
                category: Some(DeviceCategory::Transportation),
                overrides: DeviceOverrides {
                    heartbeat_interval_secs: Some(30.0),
                    command_timeout_secs: Some(10.0),
                    reconnect_attempts: Some(3),
                    max_command_queue: Some(50),
                    enable_logging: Some(true),
                    ..DeviceOverrides::default()
                },
            },
        );
        device_types.insert(
            "door_access".to_owned(),
            DeviceTypeSection {
                category: Some(DeviceCategory::Security),
                overrides: DeviceOverrides {
                    heartbeat_interval_secs: Some(20.0),
                    command_timeout_secs: Some(8.0),
                    reconnect_attempts: Some(5),
                    max_command_queue: Some(30),
                    enable_logging: Some(true),
                    ..DeviceOverrides::default()
                },
            },
        );
        Self {
            runtime: RuntimeDefaults::default(),
            batch: BatchSection::default(),
            device_types,
            devices: Vec::new(),
        }
    }
}

/// `[runtime]`: fleet-wide device defaults. Durations in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeDefaults {
    pub firmware_version: String,
    pub heartbeat_interval_secs: f64,
    pub command_timeout_secs: f64,
    pub max_command_queue: usize,
    pub reconnect_attempts: u32,
    pub reconnect_delay_secs: f64,
    pub enable_logging: bool,
    pub reboot_delay_secs: f64,
    pub firmware_update_duration_secs: f64,
    pub error_history: usize,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        let base = DeviceConfig::new("", "");
        Self {
            firmware_version: base.firmware_version,
            heartbeat_interval_secs: base.heartbeat_interval.as_secs_f64(),
            command_timeout_secs: base.command_timeout.as_secs_f64(),
            max_command_queue: base.max_command_queue,
            reconnect_attempts: base.reconnect_attempts,
            reconnect_delay_secs: base.reconnect_delay.as_secs_f64(),
            enable_logging: base.enable_logging,
            reboot_delay_secs: base.reboot_delay.as_secs_f64(),
            firmware_update_duration_secs: base.firmware_update_duration.as_secs_f64(),
            error_history: base.error_history,
        }
    }
}

impl RuntimeDefaults {
    fn as_overrides(&self) -> DeviceOverrides {
        DeviceOverrides {
            firmware_version: Some(self.firmware_version.clone()),
            heartbeat_interval_secs: Some(self.heartbeat_interval_secs),
            command_timeout_secs: Some(self.command_timeout_secs),
            max_command_queue: Some(self.max_command_queue),
            reconnect_attempts: Some(self.reconnect_attempts),
            reconnect_delay_secs: Some(self.reconnect_delay_secs),
            enable_logging: Some(self.enable_logging),
            reboot_delay_secs: Some(self.reboot_delay_secs),
            firmware_update_duration_secs: Some(self.firmware_update_duration_secs),
            error_history: Some(self.error_history),
        }
    }
}

/// Optional per-type or per-device settings. Unset fields fall through
/// to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DeviceOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_command_queue: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_delay_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_logging: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_delay_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_update_duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_history: Option<usize>,
}

impl DeviceOverrides {
    /// Write every set field into `config`.
    fn apply(&self, config: &mut DeviceConfig) -> Result<(), ConfigError> {
        if let Some(v) = &self.firmware_version {
            config.firmware_version.clone_from(v);
        }
        if let Some(v) = self.heartbeat_interval_secs {
            config.heartbeat_interval = secs("heartbeat_interval_secs", v)?;
        }
        if let Some(v) = self.command_timeout_secs {
            config.command_timeout = secs("command_timeout_secs", v)?;
        }
        if let Some(v) = self.max_command_queue {
            config.max_command_queue = v;
        }
        if let Some(v) = self.reconnect_attempts {
            config.reconnect_attempts = v;
        }
        if let Some(v) = self.reconnect_delay_secs {
            config.reconnect_delay = secs("reconnect_delay_secs", v)?;
        }
        if let Some(v) = self.enable_logging {
            config.enable_logging = v;
        }
        if let Some(v) = self.reboot_delay_secs {
            config.reboot_delay = secs("reboot_delay_secs", v)?;
        }
        if let Some(v) = self.firmware_update_duration_secs {
            config.firmware_update_duration = secs("firmware_update_duration_secs", v)?;
        }
        if let Some(v) = self.error_history {
            config.error_history = v;
        }
        Ok(())
    }
}

fn secs(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| invalid(field, format!("expected a non-negative number of seconds, got {value}")))
}

/// `[device_types.<tag>]`: category plus template overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DeviceTypeSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<DeviceCategory>,
    #[serde(flatten)]
    pub overrides: DeviceOverrides,
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub device_type: String,
    #[serde(flatten)]
    pub overrides: DeviceOverrides,
}

/// `[batch]`: writer settings with optional `[batch.kinds.<kind>]` tables.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSection {
    pub batch_size: usize,
    pub flush_interval_secs: f64,
    pub max_flush_attempts: u32,
    pub kinds: BTreeMap<String, KindSection>,
}

impl Default for BatchSection {
    fn default() -> Self {
        let base = BatchWriterConfig::default();
        Self {
            batch_size: base.batch_size,
            flush_interval_secs: base.flush_interval.as_secs_f64(),
            max_flush_attempts: base.max_flush_attempts,
            kinds: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct KindSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

// ── Translation into core records ───────────────────────────────────

impl FleetConfig {
    /// Build the `DeviceConfig` for `entry`: runtime defaults, then the
    /// type template, then the entry's own overrides.
    pub fn device_config(&self, entry: &DeviceEntry) -> Result<DeviceConfig, ConfigError> {
        if entry.device_id.trim().is_empty() {
            return Err(invalid("device_id", "must not be empty"));
        }
        let mut config = DeviceConfig::new(entry.device_id.as_str(), entry.device_type.as_str());
        self.runtime.as_overrides().apply(&mut config)?;
        if let Some(section) = self.device_types.get(&entry.device_type) {
            section.overrides.apply(&mut config)?;
        }
        entry.overrides.apply(&mut config)?;
        validate_device(&config)?;
        Ok(config)
    }

    /// Configs for every `[[devices]]` entry, in file order.
    pub fn device_configs(&self) -> Result<Vec<DeviceConfig>, ConfigError> {
        self.devices.iter().map(|e| self.device_config(e)).collect()
    }

    pub fn batch_config(&self) -> Result<BatchWriterConfig, ConfigError> {
        let batch = &self.batch;
        if batch.batch_size == 0 {
            return Err(invalid("batch.batch_size", "must be at least 1"));
        }
        if batch.max_flush_attempts == 0 {
            return Err(invalid("batch.max_flush_attempts", "must be at least 1"));
        }
        let flush_interval = non_zero_secs("batch.flush_interval_secs", batch.flush_interval_secs)?;
        let mut config = BatchWriterConfig::new(batch.batch_size, flush_interval);
        config.max_flush_attempts = batch.max_flush_attempts;

        for (name, section) in &batch.kinds {
            let field = format!("batch.kinds.{name}");
            let kind: RecordKind = name
                .parse()
                .map_err(|_| invalid(&field, "unknown record kind"))?;
            let batch_size = section.batch_size.unwrap_or(config.batch_size);
            if batch_size == 0 {
                return Err(invalid(format!("{field}.batch_size"), "must be at least 1"));
            }
            config = config.with_policy(kind, KindPolicy { batch_size });
        }
        Ok(config)
    }

    /// Create a runtime in `registry` for every `[[devices]]` entry.
    ///
    /// Stops at the first failure; runtimes created before it stay
    /// registered.
    pub fn create_devices(
        &self,
        registry: &DeviceRegistry,
    ) -> Result<Vec<Arc<DeviceRuntime>>, ConfigError> {
        let mut created = Vec::with_capacity(self.devices.len());
        for entry in &self.devices {
            let config = self.device_config(entry)?;
            let runtime = registry.create(config)?;
            tracing::debug!(device_id = %entry.device_id, "device created from config");
            created.push(runtime);
        }
        Ok(created)
    }
}

fn non_zero_secs(field: &str, value: f64) -> Result<Duration, ConfigError> {
    let duration = secs(field, value)?;
    if duration.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(duration)
}

fn validate_device(config: &DeviceConfig) -> Result<(), ConfigError> {
    let id = &config.device_id;
    if config.heartbeat_interval.is_zero() {
        return Err(invalid(
            format!("{id}.heartbeat_interval_secs"),
            "must be greater than zero",
        ));
    }
    if config.command_timeout.is_zero() {
        return Err(invalid(
            format!("{id}.command_timeout_secs"),
            "must be greater than zero",
        ));
    }
    if config.max_command_queue == 0 {
        return Err(invalid(
            format!("{id}.max_command_queue"),
            "must be at least 1",
        ));
    }
    Ok(())
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "ecufleet", "ecufleet").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("ecufleet");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

fn figment_for(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(FleetConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("ECUFLEET_").split("__"))
}

/// Load from the canonical path + environment.
pub fn load_config() -> Result<FleetConfig, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<FleetConfig, ConfigError> {
    let config: FleetConfig = figment_for(path).extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &FleetConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
