// ── Device registry ──
//
// Explicit registry of device types and live runtimes. Hosts create one
// and pass it by handle; there is no process-wide instance.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{Display, EnumString};
use tracing::{debug, info};

use crate::command::Params;
use crate::config::DeviceConfig;
use crate::device::{DeviceBehavior, DoorAccess, SharedBike};
use crate::error::CoreError;
use crate::model::DeviceStatus;
use crate::runtime::DeviceRuntime;
use crate::telemetry::TelemetryBuffer;

/// Coarse grouping of device types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceCategory {
    Transportation,
    Security,
    Utility,
    Industrial,
    Consumer,
}

/// Per-type overrides applied on top of `DeviceConfig` defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTemplate {
    pub heartbeat_interval: Option<Duration>,
    pub command_timeout: Option<Duration>,
    pub max_command_queue: Option<usize>,
    pub reconnect_attempts: Option<u32>,
    pub enable_logging: Option<bool>,
    /// Attributes seeded into every runtime of this type.
    pub attributes: Params,
}

impl ConfigTemplate {
    pub fn apply(&self, config: &mut DeviceConfig) {
        if let Some(v) = self.heartbeat_interval {
            config.heartbeat_interval = v;
        }
        if let Some(v) = self.command_timeout {
            config.command_timeout = v;
        }
        if let Some(v) = self.max_command_queue {
            config.max_command_queue = v;
        }
        if let Some(v) = self.reconnect_attempts {
            config.reconnect_attempts = v;
        }
        if let Some(v) = self.enable_logging {
            config.enable_logging = v;
        }
    }
}

type BehaviorFactory = Arc<dyn Fn(&DeviceConfig) -> Arc<dyn DeviceBehavior> + Send + Sync>;

/// A registered device type.
#[derive(Clone)]
pub struct DeviceTypeEntry {
    pub device_type: String,
    pub category: DeviceCategory,
    pub template: ConfigTemplate,
    factory: BehaviorFactory,
}

impl DeviceTypeEntry {
    pub fn new<F>(device_type: impl Into<String>, category: DeviceCategory, factory: F) -> Self
    where
        F: Fn(&DeviceConfig) -> Arc<dyn DeviceBehavior> + Send + Sync + 'static,
    {
        Self {
            device_type: device_type.into(),
            category,
            template: ConfigTemplate::default(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_template(mut self, template: ConfigTemplate) -> Self {
        self.template = template;
        self
    }
}

/// One row of [`DeviceRegistry::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub device_type: String,
    pub category: Option<DeviceCategory>,
    pub status: DeviceStatus,
    pub firmware_version: String,
}

pub struct DeviceRegistry {
    types: DashMap<String, DeviceTypeEntry>,
    devices: DashMap<String, Arc<DeviceRuntime>>,
    telemetry: Option<Arc<dyn TelemetryBuffer>>,
}

impl DeviceRegistry {
    /// Empty registry. Runtimes it creates write into `telemetry`.
    pub fn new(telemetry: Option<Arc<dyn TelemetryBuffer>>) -> Self {
        Self {
            types: DashMap::new(),
            devices: DashMap::new(),
            telemetry,
        }
    }

    /// Registry with `shared_bike` and `door_access` registered.
    pub fn with_builtin_types(telemetry: Option<Arc<dyn TelemetryBuffer>>) -> Self {
        let registry = Self::new(telemetry);
        registry.register_type(
            DeviceTypeEntry::new("shared_bike", DeviceCategory::Transportation, |_| -> Arc<dyn DeviceBehavior> {
                Arc::new(SharedBike::new())
            })
            .with_template(ConfigTemplate {
                heartbeat_interval: Some(Duration::from_secs(30)),
                command_timeout: Some(Duration::from_secs(10)),
                max_command_queue: Some(50),
                reconnect_attempts: Some(3),
                enable_logging: Some(true),
                attributes: Params::new(),
            }),
        );
        let mut door_attributes = Params::new();
        door_attributes.insert("security_level".into(), json!("medium"));
        registry.register_type(
            DeviceTypeEntry::new("door_access", DeviceCategory::Security, |_| -> Arc<dyn DeviceBehavior> {
                Arc::new(DoorAccess::new())
            })
            .with_template(ConfigTemplate {
                heartbeat_interval: Some(Duration::from_secs(20)),
                command_timeout: Some(Duration::from_secs(8)),
                max_command_queue: Some(30),
                reconnect_attempts: Some(5),
                enable_logging: Some(true),
                attributes: door_attributes,
            }),
        );
        registry
    }

    // ── Device types ─────────────────────────────────────────────────

    /// Register or replace a device type.
    pub fn register_type(&self, entry: DeviceTypeEntry) {
        debug!(device_type = %entry.device_type, category = %entry.category, "device type registered");
        self.types.insert(entry.device_type.clone(), entry);
    }

    /// Registered type tags, sorted, optionally filtered by category.
    pub fn device_types(&self, category: Option<DeviceCategory>) -> Vec<String> {
        let mut tags: Vec<String> = self
            .types
            .iter()
            .filter(|e| category.is_none_or(|c| e.value().category == c))
            .map(|e| e.key().clone())
            .collect();
        tags.sort();
        tags
    }

    pub fn category_of(&self, device_type: &str) -> Option<DeviceCategory> {
        self.types.get(device_type).map(|e| e.category)
    }

    pub fn template_of(&self, device_type: &str) -> Option<ConfigTemplate> {
        self.types.get(device_type).map(|e| e.template.clone())
    }

    // ── Runtimes ─────────────────────────────────────────────────────

    /// Build a runtime for `config`. The runtime is registered but not
    /// started.
    pub fn create(&self, config: DeviceConfig) -> Result<Arc<DeviceRuntime>, CoreError> {
        let (factory, template) = {
            let entry = self.types.get(&config.device_type).ok_or_else(|| {
                CoreError::UnknownDeviceType {
                    device_type: config.device_type.clone(),
                }
            })?;
            (Arc::clone(&entry.factory), entry.template.clone())
        };

        if self.devices.contains_key(&config.device_id) {
            return Err(CoreError::DuplicateDevice {
                device_id: config.device_id,
            });
        }

        // No shard lock is held while the factory runs.
        let device_id = config.device_id.clone();
        let behavior = factory(&config);
        let runtime = Arc::new(DeviceRuntime::new(config, behavior, self.telemetry.clone()));
        for (key, value) in template.attributes {
            runtime.set_attribute(key, value);
        }

        match self.devices.entry(device_id) {
            Entry::Occupied(slot) => Err(CoreError::DuplicateDevice {
                device_id: slot.key().clone(),
            }),
            Entry::Vacant(slot) => {
                info!(device_id = %slot.key(), device_type = runtime.device_type(), "device created");
                slot.insert(Arc::clone(&runtime));
                Ok(runtime)
            }
        }
    }

    /// Build a runtime from defaults plus the type's registered template.
    pub fn create_from_template(
        &self,
        device_id: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Result<Arc<DeviceRuntime>, CoreError> {
        let mut config = DeviceConfig::new(device_id, device_type);
        let template = self.template_of(&config.device_type).ok_or_else(|| {
            CoreError::UnknownDeviceType {
                device_type: config.device_type.clone(),
            }
        })?;
        template.apply(&mut config);
        self.create(config)
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceRuntime>> {
        self.devices.get(device_id).map(|r| Arc::clone(r.value()))
    }

    /// Unregister a runtime and stop it.
    pub async fn remove(&self, device_id: &str) -> Result<(), CoreError> {
        let Some((_, runtime)) = self.devices.remove(device_id) else {
            return Err(CoreError::DeviceNotFound {
                device_id: device_id.to_owned(),
            });
        };
        runtime.stop().await;
        info!(device_id, "device removed");
        Ok(())
    }

    /// Summaries of every registered runtime, sorted by id.
    pub fn list(&self) -> Vec<DeviceSummary> {
        let mut rows: Vec<DeviceSummary> = self
            .devices
            .iter()
            .map(|entry| {
                let runtime = entry.value();
                DeviceSummary {
                    device_id: runtime.device_id().to_owned(),
                    device_type: runtime.device_type().to_owned(),
                    category: self.category_of(runtime.device_type()),
                    status: runtime.status(),
                    firmware_version: runtime.firmware_version(),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        rows
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn runtimes(&self) -> Vec<Arc<DeviceRuntime>> {
        self.devices.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub async fn start_all(&self) {
        let runtimes = self.runtimes();
        join_all(runtimes.iter().map(|r| r.start())).await;
    }

    pub async fn stop_all(&self) {
        let runtimes = self.runtimes();
        join_all(runtimes.iter().map(|r| r.stop())).await;
        info!(count = runtimes.len(), "all devices stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builtin_types_are_categorized() {
        let registry = DeviceRegistry::with_builtin_types(None);
        assert_eq!(registry.device_types(None), vec!["door_access", "shared_bike"]);
        assert_eq!(
            registry.device_types(Some(DeviceCategory::Security)),
            vec!["door_access"]
        );
        assert_eq!(
            registry.category_of("shared_bike"),
            Some(DeviceCategory::Transportation)
        );
    }

    #[test]
    fn template_overrides_defaults() {
        let mut config = DeviceConfig::new("door-1", "door_access");
        let registry = DeviceRegistry::with_builtin_types(None);
        registry.template_of("door_access").unwrap().apply(&mut config);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.max_command_queue, 30);
        assert_eq!(config.command_timeout, Duration::from_secs(8));
    }
}
