// ── Simulated shared-bike lock ──

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::info;

use super::{
    DeviceBehavior, DeviceContext, LockMechanism, Lockable, StatusReporting, bool_param,
    string_param,
};
use crate::command::{Params, f64_param, params as payload};
use crate::error::{CommandError, ErrorCode, HandlerResult};

const MIN_UNLOCK_BATTERY: f64 = 10.0;
const LOW_BATTERY: f64 = 20.0;
const COST_PER_MINUTE: f64 = 0.5;

#[derive(Debug, Clone)]
struct Ride {
    user_id: String,
    started_at: DateTime<Utc>,
    start_mileage: f64,
    start_battery: f64,
    start_location: Value,
}

/// A rental bike with a smart lock.
///
/// Lock state, battery, mileage and lock-mechanism condition live in the
/// device attributes, so `update_config` can change them. An unlock
/// starts a ride; the next lock closes it and emits a usage record.
pub struct SharedBike {
    actuation_delay: Duration,
    ride: Mutex<Option<Ride>>,
}

impl SharedBike {
    pub fn new() -> Self {
        Self::with_actuation_delay(Duration::from_millis(1500))
    }

    /// Time the lock motor takes to move. Zero in most tests.
    pub fn with_actuation_delay(actuation_delay: Duration) -> Self {
        Self {
            actuation_delay,
            ride: Mutex::new(None),
        }
    }

    async fn actuate(&self, mechanism: LockMechanism) {
        if mechanism == LockMechanism::Stuck {
            tokio::time::sleep(self.actuation_delay).await;
        }
        tokio::time::sleep(self.actuation_delay).await;
    }

    async fn complete_ride(&self, ctx: &DeviceContext, ride: Ride) {
        let now = Utc::now();
        let duration_secs = now
            .signed_duration_since(ride.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let mileage = ctx.f64_attribute("mileage").unwrap_or(ride.start_mileage);
        let distance = (mileage - ride.start_mileage).max(0.0);
        let average_speed = if duration_secs > 0.0 {
            distance / (duration_secs / 3600.0)
        } else {
            0.0
        };
        let cost = (duration_secs / 60.0 * COST_PER_MINUTE * 100.0).round() / 100.0;
        let battery = ctx.f64_attribute("battery_level").unwrap_or(0.0);

        let ride_id = format!(
            "ride_{}_{}",
            ride.started_at.format("%Y%m%d_%H%M%S"),
            ctx.device_id()
        );
        info!(device_id = ctx.device_id(), %ride_id, distance, "ride completed");
        ctx.emit_usage(payload([
            ("ride_id", json!(ride_id)),
            ("user_id", json!(ride.user_id)),
            ("start_time", json!(ride.started_at)),
            ("end_time", json!(now)),
            ("duration_secs", json!(duration_secs)),
            ("distance_km", json!(distance)),
            ("start_location", ride.start_location),
            ("end_location", ctx.attribute("location").unwrap_or(Value::Null)),
            ("average_speed", json!(average_speed)),
            ("cost", json!(cost)),
            ("payment_status", json!("pending")),
            ("battery_usage", json!(ride.start_battery - battery)),
        ]))
        .await;
    }
}

impl Default for SharedBike {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Lockable for SharedBike {
    async fn lock(&self, ctx: &DeviceContext, params: &Params) -> HandlerResult {
        let force = bool_param(params, "force");
        let user_id = string_param(params, "user_id", "system");
        let reason = string_param(params, "reason", "normal_lock");
        let mechanism = LockMechanism::from_attribute(ctx, "lock_status");

        if ctx.bool_attribute("is_locked").unwrap_or(true) {
            return Ok(payload([
                ("message", json!("Device is already locked")),
                ("already_locked", json!(true)),
                ("lock_status", json!(mechanism.to_string())),
            ]));
        }
        if ctx.f64_attribute("current_speed").unwrap_or(0.0) > 1.0 && !force {
            return Err(CommandError::invalid_state("Cannot lock while bike is moving"));
        }
        if mechanism == LockMechanism::Broken {
            return Err(CommandError::unavailable("Lock mechanism is broken"));
        }

        info!(device_id = ctx.device_id(), %user_id, "locking bike");
        self.actuate(mechanism).await;

        ctx.set_attribute("is_locked", json!(true));
        ctx.set_attribute("current_speed", json!(0.0));
        ctx.set_attribute("lock_status", json!(LockMechanism::Normal.to_string()));

        let ride = self.ride.lock().take();
        if let Some(ride) = ride {
            self.complete_ride(ctx, ride).await;
        }

        let event = payload([
            ("user_id", json!(user_id)),
            ("reason", json!(reason)),
            ("force_mode", json!(force)),
            ("location", ctx.attribute("location").unwrap_or(Value::Null)),
        ]);
        ctx.emit_event("lock", event.clone()).await;

        Ok(payload([
            ("message", json!("Bike locked successfully")),
            ("lock_status", json!("normal")),
            ("event", Value::Object(event)),
        ]))
    }

    async fn unlock(&self, ctx: &DeviceContext, params: &Params) -> HandlerResult {
        let user_id = string_param(params, "user_id", "unknown");
        let auth_code = string_param(params, "auth_code", "");
        let duration = f64_param(params, "duration").unwrap_or(3600.0);

        if auth_code.is_empty() {
            return Err(CommandError::permission_denied(
                "Authorization code required",
            ));
        }
        if !ctx.bool_attribute("is_locked").unwrap_or(true) {
            return Ok(payload([
                ("message", json!("Device is already unlocked")),
                ("already_unlocked", json!(true)),
            ]));
        }
        let battery = ctx.f64_attribute("battery_level").unwrap_or(0.0);
        if battery < MIN_UNLOCK_BATTERY {
            return Err(CommandError::unavailable("Battery level too low"));
        }
        let mechanism = LockMechanism::from_attribute(ctx, "lock_status");
        if mechanism == LockMechanism::Broken {
            return Err(CommandError::unavailable("Lock mechanism is broken"));
        }

        info!(device_id = ctx.device_id(), %user_id, "unlocking bike");
        self.actuate(mechanism).await;

        ctx.set_attribute("is_locked", json!(false));
        ctx.set_attribute("lock_status", json!(LockMechanism::Normal.to_string()));

        let started_at = Utc::now();
        let location = ctx.attribute("location").unwrap_or(Value::Null);
        *self.ride.lock() = Some(Ride {
            user_id: user_id.clone(),
            started_at,
            start_mileage: ctx.f64_attribute("mileage").unwrap_or(0.0),
            start_battery: battery,
            start_location: location.clone(),
        });

        let code_prefix: String = auth_code.chars().take(8).collect();
        #[allow(clippy::cast_possible_truncation)]
        let expires_at = started_at + chrono::Duration::seconds(duration.max(0.0) as i64);
        let event = payload([
            ("user_id", json!(user_id)),
            ("location", location),
            ("auth_code", json!(code_prefix)),
            ("duration_limit", json!(duration)),
            ("battery_level", json!(battery)),
        ]);
        ctx.emit_event("unlock", event.clone()).await;

        Ok(payload([
            ("message", json!("Bike unlocked successfully")),
            ("unlock_time", json!(started_at)),
            ("expires_at", json!(expires_at)),
            ("auth_code", json!(code_prefix)),
            ("event", Value::Object(event)),
        ]))
    }
}

#[async_trait]
impl StatusReporting for SharedBike {
    async fn get_status(&self, ctx: &DeviceContext, params: &Params) -> HandlerResult {
        let detailed = bool_param(params, "detailed");
        let battery = ctx.f64_attribute("battery_level").unwrap_or(0.0);
        let mut status = payload([
            ("device_id", json!(ctx.device_id())),
            ("is_locked", json!(ctx.bool_attribute("is_locked").unwrap_or(true))),
            ("battery_level", json!(battery)),
            ("mileage", ctx.attribute("mileage").unwrap_or(Value::Null)),
            ("current_speed", ctx.attribute("current_speed").unwrap_or(Value::Null)),
            ("location", ctx.attribute("location").unwrap_or(Value::Null)),
            ("temperature", ctx.attribute("temperature").unwrap_or(Value::Null)),
            ("lock_status", ctx.attribute("lock_status").unwrap_or(Value::Null)),
            ("ride_active", json!(self.ride.lock().is_some())),
            ("serial_number", json!(format!("SN{}", ctx.device_id()))),
        ]);
        if detailed {
            let battery_health = if battery > LOW_BATTERY { "normal" } else { "low" };
            status.insert(
                "hardware_status".into(),
                json!({
                    "lock": ctx.attribute("lock_status").unwrap_or(Value::Null),
                    "battery": battery_health,
                    "gps": "normal",
                }),
            );
            status.insert(
                "power_info".into(),
                json!({
                    "battery_level": battery,
                    "estimated_remaining_hours": battery * 0.5,
                }),
            );
        }
        Ok(payload([
            ("status", Value::Object(status)),
            ("detailed", json!(detailed)),
        ]))
    }
}

#[async_trait]
impl DeviceBehavior for SharedBike {
    fn initial_attributes(&self) -> Params {
        payload([
            ("battery_level", json!(85.0)),
            ("is_locked", json!(true)),
            ("mileage", json!(1256.3)),
            ("current_speed", json!(0.0)),
            (
                "location",
                json!({ "latitude": 31.2304, "longitude": 121.4737, "accuracy": 10.0 }),
            ),
            ("temperature", json!(25.5)),
            ("lock_status", json!("normal")),
        ])
    }

    async fn custom_command(&self, ctx: &DeviceContext, name: &str, params: &Params) -> HandlerResult {
        match name {
            "charge_battery" => {
                let amount = f64_param(params, "amount")
                    .ok_or_else(|| CommandError::invalid_params("amount is required"))?;
                let level = (ctx.f64_attribute("battery_level").unwrap_or(0.0) + amount).clamp(0.0, 100.0);
                ctx.set_attribute("battery_level", json!(level));
                Ok(payload([("battery_level", json!(level))]))
            }
            "simulate_movement" => {
                if ctx.bool_attribute("is_locked").unwrap_or(true) {
                    return Err(CommandError::invalid_state("Bike is locked"));
                }
                let speed = f64_param(params, "speed_kmh").unwrap_or(0.0);
                let minutes = f64_param(params, "duration_minutes").unwrap_or(0.0);
                if speed < 0.0 || minutes < 0.0 {
                    return Err(CommandError::new(
                        ErrorCode::InvalidParams,
                        "speed and duration must be non-negative",
                    ));
                }
                let mileage = ctx.f64_attribute("mileage").unwrap_or(0.0) + speed * minutes / 60.0;
                ctx.set_attribute("mileage", json!(mileage));
                ctx.set_attribute("current_speed", json!(speed));
                Ok(payload([
                    ("mileage", json!(mileage)),
                    ("current_speed", json!(speed)),
                ]))
            }
            _ => Err(CommandError::method_not_found(name)),
        }
    }
}
