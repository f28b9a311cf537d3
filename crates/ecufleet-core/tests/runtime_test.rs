#![allow(clippy::unwrap_used)]
// Integration tests for `DeviceRuntime` lifecycle, queueing and built-in
// commands. Time is paused so sleeps and intervals advance instantly.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::json;

use ecufleet_core::command::params;
use ecufleet_core::{CoreError, DeviceStatus, ErrorCode, Params, RecordKind};

use common::{count_heartbeats, record_statuses, runtime_with, test_config};

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_new_runtime_is_offline_until_started() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    assert_eq!(runtime.status(), DeviceStatus::Offline);
    assert!(!runtime.is_running());

    runtime.start().await;
    assert_eq!(runtime.status(), DeviceStatus::Online);
    assert!(runtime.is_running());

    runtime.stop().await;
    assert_eq!(runtime.status(), DeviceStatus::Offline);
    assert!(!runtime.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_are_idempotent() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    let statuses = record_statuses(&runtime);

    runtime.start().await;
    runtime.start().await;
    runtime.stop().await;
    runtime.stop().await;

    assert_eq!(
        *statuses.lock(),
        vec![DeviceStatus::Online, DeviceStatus::Offline]
    );
}

#[tokio::test(start_paused = true)]
async fn test_debug_output_names_device_and_status() {
    let (runtime, _, _) = runtime_with(test_config("dev-7"));
    let offline = format!("{runtime:?}");
    assert!(offline.contains("\"dev-7\""), "{offline}");
    assert!(offline.contains("Offline"), "{offline}");

    runtime.start().await;
    assert!(format!("{runtime:?}").contains("Online"));
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_accepts_commands() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    runtime.start().await;
    runtime.stop().await;
    runtime.start().await;

    let result = runtime.execute_command("echo", Params::new()).await;
    assert!(result.success, "{result:?}");
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_status_records_are_logged() {
    let (runtime, _, buffer) = runtime_with(test_config("dev-1"));
    runtime.start().await;
    runtime.stop().await;

    let records = buffer.of_kind(RecordKind::Status);
    let statuses: Vec<_> = records
        .iter()
        .map(|r| r.payload["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("online"), json!("offline")]);
}

// ── Command queue ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_commands_run_in_submission_order() {
    let (runtime, device, _) = runtime_with(test_config("dev-1"));
    runtime.start().await;

    let submissions = (0..5).map(|n| runtime.execute_command("echo", params([("n", json!(n))])));
    let results = join_all(submissions).await;

    assert!(results.iter().all(|r| r.success));
    assert_eq!(
        device.seen(),
        vec!["echo:0", "echo:1", "echo:2", "echo:3", "echo:4"]
    );
    assert_eq!(runtime.stats().commands_executed, 5);
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_offline_commands_are_rejected_and_counted() {
    let (runtime, device, _) = runtime_with(test_config("dev-1"));

    for _ in 0..3 {
        let result = runtime.execute_command("echo", Params::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::DeviceOffline));
        assert_eq!(result.code(), Some(-32001));
    }

    let stats = runtime.stats();
    assert_eq!(stats.commands_received, 3);
    assert_eq!(stats.errors, 3);
    assert_eq!(runtime.error_count(), 3);
    assert!(device.seen().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_with_queue_full() {
    let mut config = test_config("dev-1");
    config.max_command_queue = 2;
    let (runtime, _, _) = runtime_with(config);
    runtime.start().await;

    let slow = || runtime.execute_command("slow", params([("ms", json!(500))]));
    let (a, b, c) = tokio::join!(slow(), slow(), slow());

    assert!(a.success);
    assert!(b.success);
    assert_eq!(c.error_code, Some(ErrorCode::QueueFull));
    assert_eq!(c.code(), Some(-32010));
    assert_eq!(runtime.queue_depth(), 0);
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_command_still_runs_and_is_logged_undelivered() {
    let mut config = test_config("dev-1");
    config.command_timeout = Duration::from_secs(1);
    let (runtime, device, buffer) = runtime_with(config);
    runtime.start().await;

    let result = runtime
        .execute_command("slow", params([("ms", json!(3000))]))
        .await;
    assert_eq!(result.error_code, Some(ErrorCode::CommandTimeout));
    assert_eq!(runtime.queue_depth(), 1);
    assert_eq!(runtime.error_count(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(runtime.queue_depth(), 0);
    assert_eq!(device.seen(), vec!["slow"]);

    let logs = buffer.of_kind(RecordKind::CommandLog);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].payload["delivered"], json!(false));
    assert_eq!(logs[0].payload["status"], json!("timeout"));
    assert_eq!(logs[0].payload["success"], json!(true));
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_answers_queued_commands_with_device_offline() {
    let (runtime, device, buffer) = runtime_with(test_config("dev-1"));
    let runtime = Arc::new(runtime);
    runtime.start().await;

    let r = runtime.clone();
    let slow = tokio::spawn(async move {
        r.execute_command("slow", params([("ms", json!(2000))]))
            .await
    });
    let r = runtime.clone();
    let queued = tokio::spawn(async move { r.execute_command("echo", Params::new()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    runtime.stop().await;

    assert!(slow.await.unwrap().success);
    let queued = queued.await.unwrap();
    assert_eq!(queued.error_code, Some(ErrorCode::DeviceOffline));
    assert_eq!(device.seen(), vec!["slow"]);

    let logs: Vec<_> = buffer
        .of_kind(RecordKind::CommandLog)
        .iter()
        .map(|r| (r.payload["command"].clone(), r.payload["status"].clone()))
        .collect();
    assert_eq!(
        logs,
        vec![
            (json!("slow"), json!("success")),
            (json!("echo"), json!("cancelled")),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_handler_panic_becomes_internal_error() {
    let (runtime, device, _) = runtime_with(test_config("dev-1"));
    runtime.start().await;

    let result = runtime.execute_command("panic", Params::new()).await;
    assert_eq!(result.error_code, Some(ErrorCode::InternalError));
    assert!(
        result
            .error_message
            .as_deref()
            .unwrap()
            .contains("simulated handler fault")
    );

    let next = runtime.execute_command("echo", Params::new()).await;
    assert!(next.success);
    assert_eq!(device.seen(), vec!["panic", "echo"]);

    let diagnostics = runtime.diagnostics();
    assert_eq!(diagnostics.recent_errors.len(), 1);
    assert_eq!(
        diagnostics.recent_errors[0].command.as_deref(),
        Some("panic")
    );
    assert_eq!(runtime.stats().commands_failed, 1);
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_command_is_method_not_found() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    runtime.start().await;

    let result = runtime.execute_command("warp_drive", Params::new()).await;
    assert_eq!(result.error_code, Some(ErrorCode::MethodNotFound));
    assert_eq!(result.code(), Some(-32601));
    runtime.stop().await;
}

// ── Heartbeats ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_heartbeats_follow_the_interval() {
    let (runtime, _, buffer) = runtime_with(test_config("dev-1"));
    let beats = count_heartbeats(&runtime);
    runtime.start().await;

    tokio::time::sleep(Duration::from_millis(3500)).await;

    let sent = beats.load(Ordering::SeqCst);
    assert!((3..=4).contains(&sent), "sent {sent} heartbeats");
    assert_eq!(runtime.stats().heartbeats_sent, sent as u64);
    assert_eq!(buffer.of_kind(RecordKind::Heartbeat).len(), sent);
    assert!(runtime.status_snapshot().last_heartbeat.is_some());
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_heartbeats_outside_online() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    let beats = count_heartbeats(&runtime);
    runtime.start().await;
    runtime.set_status(DeviceStatus::Maintenance).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(beats.load(Ordering::SeqCst), 0);

    runtime.set_status(DeviceStatus::Online).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(beats.load(Ordering::SeqCst), 1);
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_halts_heartbeats() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    let beats = count_heartbeats(&runtime);
    runtime.start().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    runtime.stop().await;

    let before = beats.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(beats.load(Ordering::SeqCst), before);
}

#[tokio::test(start_paused = true)]
async fn test_drop_cancels_running_loops() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    let beats = count_heartbeats(&runtime);
    runtime.start().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(beats.load(Ordering::SeqCst), 1);

    drop(runtime);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(beats.load(Ordering::SeqCst), 1);
}

// ── Built-in commands ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_update_config_merges_attributes() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    runtime.start().await;

    let result = runtime
        .execute_command(
            "update_config",
            params([("config", json!({ "color": "red", "volume": 3 }))]),
        )
        .await;
    assert!(result.success);
    assert_eq!(runtime.attribute("color"), Some(json!("red")));
    assert_eq!(runtime.attribute("volume"), Some(json!(3)));
    assert_eq!(runtime.attribute("is_locked"), Some(json!(true)));

    let bad = runtime
        .execute_command("update_config", params([("config", json!("red"))]))
        .await;
    assert_eq!(bad.error_code, Some(ErrorCode::InvalidParams));
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reboot_cycles_status_and_resumes_heartbeats() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    let beats = count_heartbeats(&runtime);
    let statuses = record_statuses(&runtime);
    runtime.start().await;

    let result = runtime
        .execute_command("reboot", params([("delay", json!(1))]))
        .await;
    assert!(result.success, "{result:?}");
    assert_eq!(runtime.status(), DeviceStatus::Online);
    assert_eq!(
        *statuses.lock(),
        vec![
            DeviceStatus::Online,
            DeviceStatus::Offline,
            DeviceStatus::Online
        ]
    );

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(beats.load(Ordering::SeqCst) >= 2);

    let after = runtime.execute_command("echo", Params::new()).await;
    assert!(after.success);
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_firmware_update_sets_version() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    let statuses = record_statuses(&runtime);
    runtime.start().await;

    let result = runtime
        .execute_command("firmware_update", params([("version", json!("2.1.0"))]))
        .await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.data["previous_version"], json!("1.0.0"));
    assert_eq!(runtime.firmware_version(), "2.1.0");
    assert_eq!(runtime.status(), DeviceStatus::Online);
    assert_eq!(
        *statuses.lock(),
        vec![
            DeviceStatus::Online,
            DeviceStatus::Updating,
            DeviceStatus::Online
        ]
    );
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_firmware_update_without_version_enters_error() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    runtime.start().await;

    let result = runtime
        .execute_command("firmware_update", Params::new())
        .await;
    assert_eq!(result.error_code, Some(ErrorCode::FirmwareError));
    assert_eq!(runtime.status(), DeviceStatus::Error);
    assert_eq!(runtime.firmware_version(), "1.0.0");

    let errors = runtime.diagnostics().recent_errors;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].command.as_deref(), Some("firmware_update"));

    runtime.set_status(DeviceStatus::Online).await.unwrap();
    assert!(runtime.execute_command("echo", Params::new()).await.success);
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_get_status_updates_last_status_update() {
    let (runtime, device, _) = runtime_with(test_config("dev-1"));
    runtime.start().await;

    let result = runtime.execute_command("get_status", Params::new()).await;
    assert!(result.success);
    assert_eq!(result.data["device_id"], json!("dev-1"));
    assert_eq!(device.seen(), vec!["get_status"]);
    assert!(runtime.status_snapshot().last_status_update.is_some());
    runtime.stop().await;
}

// ── Status overrides ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_set_status_requires_running_runtime() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    let err = runtime.set_status(DeviceStatus::Busy).await.unwrap_err();
    assert!(matches!(err, CoreError::NotRunning { .. }), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_set_status_rejects_lifecycle_states() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    runtime.start().await;

    for target in [DeviceStatus::Offline, DeviceStatus::Updating] {
        let err = runtime.set_status(target).await.unwrap_err();
        assert!(
            matches!(err, CoreError::InvalidTransition { .. }),
            "{err:?}"
        );
    }
    assert_eq!(runtime.status(), DeviceStatus::Online);
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_busy_device_rejects_commands() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    runtime.start().await;
    runtime.set_status(DeviceStatus::Busy).await.unwrap();

    let result = runtime.execute_command("echo", Params::new()).await;
    assert_eq!(result.error_code, Some(ErrorCode::DeviceBusy));

    runtime.set_status(DeviceStatus::Online).await.unwrap();
    assert!(runtime.execute_command("echo", Params::new()).await.success);
    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_status_callback_does_not_block_transition() {
    let (runtime, _, _) = runtime_with(test_config("dev-1"));
    runtime.on_status_change(|_| async {
        Err::<(), _>(ecufleet_core::CallbackError::from("subscriber down"))
    });
    let statuses = record_statuses(&runtime);

    runtime.start().await;
    assert_eq!(runtime.status(), DeviceStatus::Online);
    assert_eq!(*statuses.lock(), vec![DeviceStatus::Online]);
    runtime.stop().await;
}
