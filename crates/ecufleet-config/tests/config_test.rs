#![allow(clippy::unwrap_used)]
// Integration tests for file + environment loading with figment::Jail.

use std::path::Path;
use std::time::Duration;

use figment::Jail;
use pretty_assertions::assert_eq;

use ecufleet_config::{ConfigError, FleetConfig, load_config_from, save_config};
use ecufleet_core::{DeviceCategory, DeviceRegistry, RecordKind};

const FLEET_TOML: &str = r#"
[runtime]
heartbeat_interval_secs = 15
reboot_delay_secs = 0.5

[batch]
batch_size = 250
flush_interval_secs = 2

[batch.kinds.heartbeat]
batch_size = 1000

[device_types.door_access]
category = "security"
command_timeout_secs = 4

[[devices]]
device_id = "bike-001"
device_type = "shared_bike"

[[devices]]
device_id = "door-001"
device_type = "door_access"
heartbeat_interval_secs = 5
firmware_version = "2.3.1"
"#;

fn load(path: &str) -> Result<FleetConfig, figment::Error> {
    load_config_from(Path::new(path)).map_err(|e| figment::Error::from(e.to_string()))
}

#[test]
fn test_missing_file_yields_defaults() {
    Jail::expect_with(|_jail| {
        let cfg = load("absent.toml")?;
        assert_eq!(cfg, FleetConfig::default());
        assert_eq!(
            cfg.device_types["shared_bike"].category,
            Some(DeviceCategory::Transportation)
        );
        Ok(())
    });
}

#[test]
fn test_file_layers_merge_in_order() {
    Jail::expect_with(|jail| {
        jail.create_file("fleet.toml", FLEET_TOML)?;
        let cfg = load("fleet.toml")?;
        assert_eq!(cfg.devices.len(), 2);

        let configs = cfg.device_configs().map_err(|e| e.to_string())?;
        let bike = &configs[0];
        assert_eq!(bike.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(bike.max_command_queue, 50);
        assert_eq!(bike.reboot_delay, Duration::from_millis(500));

        let door = &configs[1];
        assert_eq!(door.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(door.command_timeout, Duration::from_secs(4));
        assert_eq!(door.max_command_queue, 30);
        assert_eq!(door.firmware_version, "2.3.1");

        let batch = cfg.batch_config().map_err(|e| e.to_string())?;
        assert_eq!(batch.batch_size, 250);
        assert_eq!(batch.flush_interval, Duration::from_secs(2));
        assert_eq!(batch.policy(RecordKind::Heartbeat).batch_size, 1000);
        assert_eq!(batch.policy(RecordKind::Status).batch_size, 250);
        Ok(())
    });
}

#[test]
fn test_environment_overrides_file() {
    Jail::expect_with(|jail| {
        jail.create_file("fleet.toml", FLEET_TOML)?;
        jail.set_env("ECUFLEET_RUNTIME__COMMAND_TIMEOUT_SECS", "3");
        jail.set_env("ECUFLEET_BATCH__BATCH_SIZE", "10");
        let cfg = load("fleet.toml")?;

        assert_eq!(cfg.batch.batch_size, 10);

        let configs = cfg.device_configs().map_err(|e| e.to_string())?;
        // Type templates still win over [runtime].
        assert_eq!(configs[0].command_timeout, Duration::from_secs(10));
        assert_eq!(configs[0].heartbeat_interval, Duration::from_secs(30));

        let mut untyped = cfg.devices[0].clone();
        untyped.device_type = "smart_meter".into();
        let meter = cfg.device_config(&untyped).map_err(|e| e.to_string())?;
        assert_eq!(meter.command_timeout, Duration::from_secs(3));
        assert_eq!(meter.heartbeat_interval, Duration::from_secs(15));
        Ok(())
    });
}

#[test]
fn test_invalid_value_reports_field() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "fleet.toml",
            r#"
            [[devices]]
            device_id = "bike-1"
            device_type = "shared_bike"
            command_timeout_secs = 0
            "#,
        )?;
        let cfg = load("fleet.toml")?;
        let err = cfg.device_config(&cfg.devices[0]).unwrap_err();
        assert!(
            matches!(&err, ConfigError::Validation { field, .. } if field == "bike-1.command_timeout_secs"),
            "{err:?}"
        );
        Ok(())
    });
}

#[test]
fn test_malformed_toml_is_a_figment_error() {
    Jail::expect_with(|jail| {
        jail.create_file("fleet.toml", "[runtime\nheartbeat_interval_secs = ")?;
        let err = load_config_from(Path::new("fleet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Figment(_)), "{err:?}");
        Ok(())
    });
}

#[test]
fn test_create_devices_registers_runtimes() {
    Jail::expect_with(|jail| {
        jail.create_file("fleet.toml", FLEET_TOML)?;
        let cfg = load("fleet.toml")?;
        let registry = DeviceRegistry::with_builtin_types(None);

        let created = cfg.create_devices(&registry).map_err(|e| e.to_string())?;
        assert_eq!(created.len(), 2);
        assert_eq!(registry.len(), 2);
        let door = registry.get("door-001").unwrap();
        assert_eq!(door.firmware_version(), "2.3.1");

        let again = cfg.create_devices(&registry).unwrap_err();
        assert!(matches!(again, ConfigError::Core(_)), "{again:?}");
        Ok(())
    });
}

#[test]
fn test_saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    let mut cfg = FleetConfig::default();
    cfg.runtime.error_history = 42;

    save_config(&cfg, &path).unwrap();
    let loaded = load_config_from(&path).unwrap();
    assert_eq!(loaded.runtime.error_history, 42);
    assert_eq!(loaded.device_types, cfg.device_types);
}
