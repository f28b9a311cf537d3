// ── Simulated door-access controller ──

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{info, warn};

use super::{
    DeviceBehavior, DeviceContext, LockMechanism, Lockable, StatusReporting, bool_param,
    string_param,
};
use crate::command::{Params, params as payload, str_param};
use crate::error::{CommandError, HandlerResult};

const ALARM_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
struct AuthorizedUser {
    name: String,
    pin: String,
    permissions: Vec<String>,
    enabled: bool,
}

impl AuthorizedUser {
    fn may(&self, permission: &str) -> bool {
        self.enabled && self.permissions.iter().any(|p| p == permission)
    }
}

#[derive(Debug, Clone)]
struct Card {
    user_id: String,
    enabled: bool,
}

#[derive(Debug)]
struct DoorState {
    users: HashMap<String, AuthorizedUser>,
    cards: HashMap<String, Card>,
    unauthorized_attempts: u32,
    unlocked_at: Option<Instant>,
}

struct Authenticated {
    user_id: String,
    name: String,
    method: &'static str,
}

/// Door controller with PIN and card authentication.
///
/// Ships with an `admin` user (PIN `123456`) and card `CARD001`. Three
/// failed authentications in a row raise an alarm event. An unlocked
/// door relocks itself once `auto_relock_after` has passed; the check
/// runs at the start of every command.
pub struct DoorAccess {
    actuation_delay: Duration,
    auto_relock_after: Duration,
    state: Mutex<DoorState>,
}

impl DoorAccess {
    pub fn new() -> Self {
        Self::with_timing(Duration::from_secs(1), Duration::from_secs(30))
    }

    pub fn with_timing(actuation_delay: Duration, auto_relock_after: Duration) -> Self {
        let mut users = HashMap::new();
        users.insert(
            "admin".to_owned(),
            AuthorizedUser {
                name: "Administrator".into(),
                pin: "123456".into(),
                permissions: ["unlock", "lock", "add_user", "view_logs"]
                    .map(String::from)
                    .to_vec(),
                enabled: true,
            },
        );
        let mut cards = HashMap::new();
        cards.insert(
            "CARD001".to_owned(),
            Card {
                user_id: "admin".into(),
                enabled: true,
            },
        );
        Self {
            actuation_delay,
            auto_relock_after,
            state: Mutex::new(DoorState {
                users,
                cards,
                unauthorized_attempts: 0,
                unlocked_at: None,
            }),
        }
    }

    fn authenticate(&self, params: &Params) -> Option<Authenticated> {
        let state = self.state.lock();
        if let Some(card_id) = str_param(params, "card_id").filter(|c| !c.is_empty()) {
            if let Some(card) = state.cards.get(card_id).filter(|c| c.enabled) {
                let name = state
                    .users
                    .get(&card.user_id)
                    .map(|u| u.name.clone())
                    .unwrap_or_default();
                return Some(Authenticated {
                    user_id: card.user_id.clone(),
                    name,
                    method: "card",
                });
            }
        }
        let user_id = str_param(params, "user_id")?;
        let pin = str_param(params, "pin_code").filter(|p| !p.is_empty())?;
        state
            .users
            .get(user_id)
            .filter(|u| u.enabled && u.pin == pin)
            .map(|u| Authenticated {
                user_id: user_id.to_owned(),
                name: u.name.clone(),
                method: "pin",
            })
    }

    fn has_permission(&self, user_id: &str, permission: &str) -> bool {
        self.state
            .lock()
            .users
            .get(user_id)
            .is_some_and(|u| u.may(permission))
    }

    async fn apply_auto_relock(&self, ctx: &DeviceContext) {
        let expired = {
            let mut state = self.state.lock();
            match state.unlocked_at {
                Some(at) if at.elapsed() >= self.auto_relock_after => {
                    state.unlocked_at = None;
                    true
                }
                _ => false,
            }
        };
        if expired && !ctx.bool_attribute("is_locked").unwrap_or(true) {
            info!(device_id = ctx.device_id(), "door relocked after timeout");
            ctx.set_attribute("is_locked", json!(true));
            ctx.set_attribute("is_open", json!(false));
            ctx.emit_event("auto_relock", payload([("reason", json!("timeout"))]))
                .await;
        }
    }

    async fn record_failed_attempt(&self, ctx: &DeviceContext) -> u32 {
        let attempts = {
            let mut state = self.state.lock();
            state.unauthorized_attempts += 1;
            state.unauthorized_attempts
        };
        if attempts >= ALARM_THRESHOLD && !ctx.bool_attribute("alarm_triggered").unwrap_or(false) {
            warn!(device_id = ctx.device_id(), attempts, "door alarm triggered");
            ctx.set_attribute("alarm_triggered", json!(true));
            ctx.emit_event(
                "alarm_triggered",
                payload([
                    ("reason", json!("multiple_unauthorized_attempts")),
                    ("severity", json!("high")),
                ]),
            )
            .await;
        }
        attempts
    }

    async fn actuate(&self, mechanism: LockMechanism) {
        if mechanism == LockMechanism::Stuck {
            tokio::time::sleep(self.actuation_delay).await;
        }
        tokio::time::sleep(self.actuation_delay).await;
    }

    fn add_user(&self, params: &Params) -> HandlerResult {
        let user_id = str_param(params, "user_id")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CommandError::invalid_params("User ID is required"))?;
        let permissions = params
            .get("permissions")
            .and_then(Value::as_array)
            .map(|perms| {
                perms
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_else(|| vec!["unlock".to_owned()]);
        let user = AuthorizedUser {
            name: string_param(params, "name", ""),
            pin: string_param(params, "pin", ""),
            permissions,
            enabled: params.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        };
        let count = {
            let mut state = self.state.lock();
            state.users.insert(user_id.to_owned(), user);
            state.users.len()
        };
        Ok(payload([
            ("message", json!(format!("User {user_id} added successfully"))),
            ("user_count", json!(count)),
        ]))
    }

    fn add_card(&self, params: &Params) -> HandlerResult {
        let card_id = str_param(params, "card_id")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CommandError::invalid_params("Card ID is required"))?;
        let card = Card {
            user_id: string_param(params, "user_id", ""),
            enabled: params.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        };
        let count = {
            let mut state = self.state.lock();
            state.cards.insert(card_id.to_owned(), card);
            state.cards.len()
        };
        Ok(payload([
            ("message", json!(format!("Card {card_id} added successfully"))),
            ("card_count", json!(count)),
        ]))
    }
}

impl Default for DoorAccess {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Lockable for DoorAccess {
    async fn lock(&self, ctx: &DeviceContext, params: &Params) -> HandlerResult {
        self.apply_auto_relock(ctx).await;
        let user_id = string_param(params, "user_id", "system");
        let reason = string_param(params, "reason", "security_lock");
        let force = bool_param(params, "force");

        if ctx.bool_attribute("is_locked").unwrap_or(true) {
            return Ok(payload([
                ("message", json!("Door is already locked")),
                ("already_locked", json!(true)),
            ]));
        }
        if ctx.bool_attribute("is_open").unwrap_or(false) && !force {
            return Err(CommandError::invalid_state("Cannot lock while door is open"));
        }
        if !self.has_permission(&user_id, "lock") {
            return Err(CommandError::permission_denied(
                "Permission denied for lock operation",
            ));
        }
        let mechanism = LockMechanism::from_attribute(ctx, "lock_mechanism_status");
        if mechanism == LockMechanism::Broken {
            return Err(CommandError::unavailable("Lock mechanism is broken"));
        }

        info!(device_id = ctx.device_id(), %user_id, "locking door");
        self.actuate(mechanism).await;
        ctx.set_attribute("is_locked", json!(true));
        ctx.set_attribute("is_open", json!(false));
        ctx.set_attribute("lock_mechanism_status", json!("normal"));
        self.state.lock().unlocked_at = None;

        let log = payload([
            ("user_id", json!(user_id)),
            ("reason", json!(reason)),
            ("location", json!("main_entrance")),
        ]);
        ctx.emit_event("door_lock", log.clone()).await;

        Ok(payload([
            ("message", json!("Door locked successfully")),
            ("lock_time", json!(Utc::now())),
            ("log", Value::Object(log)),
        ]))
    }

    async fn unlock(&self, ctx: &DeviceContext, params: &Params) -> HandlerResult {
        self.apply_auto_relock(ctx).await;
        if !ctx.bool_attribute("is_locked").unwrap_or(true) {
            return Ok(payload([
                ("message", json!("Door is already unlocked")),
                ("already_unlocked", json!(true)),
            ]));
        }

        let Some(auth) = self.authenticate(params) else {
            let attempts = self.record_failed_attempt(ctx).await;
            return Err(CommandError::permission_denied(format!(
                "Authentication failed ({attempts} unauthorized attempts)"
            )));
        };
        if !self.has_permission(&auth.user_id, "unlock") {
            return Err(CommandError::permission_denied(
                "Permission denied for unlock operation",
            ));
        }
        self.state.lock().unauthorized_attempts = 0;

        let mechanism = LockMechanism::from_attribute(ctx, "lock_mechanism_status");
        if mechanism == LockMechanism::Broken {
            return Err(CommandError::unavailable("Lock mechanism is broken"));
        }

        info!(device_id = ctx.device_id(), user_id = %auth.user_id, "unlocking door");
        self.actuate(mechanism).await;
        ctx.set_attribute("is_locked", json!(false));
        ctx.set_attribute("is_open", json!(true));
        ctx.set_attribute("lock_mechanism_status", json!("normal"));
        let now = Utc::now();
        ctx.set_attribute("last_access_time", json!(now));
        self.state.lock().unlocked_at = Some(Instant::now());

        let log = payload([
            ("user_id", json!(auth.user_id)),
            ("auth_method", json!(auth.method)),
            ("location", json!("main_entrance")),
        ]);
        ctx.emit_event("door_unlock", log.clone()).await;
        if ctx.str_attribute("security_level").as_deref() == Some("high") {
            ctx.emit_event(
                "security_photo",
                payload([
                    ("action", json!("unlock")),
                    ("photo_id", json!(format!("photo_{}", now.format("%Y%m%d_%H%M%S")))),
                ]),
            )
            .await;
        }

        Ok(payload([
            ("message", json!("Door unlocked successfully")),
            ("unlock_time", json!(now)),
            (
                "user_info",
                json!({ "user_id": auth.user_id, "name": auth.name, "auth_method": auth.method }),
            ),
            ("log", Value::Object(log)),
        ]))
    }
}

#[async_trait]
impl StatusReporting for DoorAccess {
    async fn get_status(&self, ctx: &DeviceContext, params: &Params) -> HandlerResult {
        self.apply_auto_relock(ctx).await;
        let detailed = bool_param(params, "detailed");
        let mut status = payload([
            ("device_id", json!(ctx.device_id())),
            ("is_locked", json!(ctx.bool_attribute("is_locked").unwrap_or(true))),
            ("is_open", json!(ctx.bool_attribute("is_open").unwrap_or(false))),
            ("access_mode", ctx.attribute("access_mode").unwrap_or(Value::Null)),
            ("security_level", ctx.attribute("security_level").unwrap_or(Value::Null)),
            ("last_access_time", ctx.attribute("last_access_time").unwrap_or(Value::Null)),
            ("alarm_triggered", json!(ctx.bool_attribute("alarm_triggered").unwrap_or(false))),
            (
                "lock_mechanism_status",
                ctx.attribute("lock_mechanism_status").unwrap_or(Value::Null),
            ),
            ("serial_number", json!(format!("SN{}", ctx.device_id()))),
        ]);
        {
            let state = self.state.lock();
            status.insert(
                "unauthorized_attempts".into(),
                json!(state.unauthorized_attempts),
            );
            if detailed {
                status.insert("authorized_user_count".into(), json!(state.users.len()));
                status.insert("authorized_card_count".into(), json!(state.cards.len()));
            }
        }
        Ok(payload([
            ("status", Value::Object(status)),
            ("detailed", json!(detailed)),
        ]))
    }
}

#[async_trait]
impl DeviceBehavior for DoorAccess {
    fn initial_attributes(&self) -> Params {
        payload([
            ("is_locked", json!(true)),
            ("is_open", json!(false)),
            ("access_mode", json!("card")),
            ("security_level", json!("medium")),
            ("alarm_triggered", json!(false)),
            ("lock_mechanism_status", json!("normal")),
            ("temperature", json!(22.5)),
            ("humidity", json!(45.0)),
        ])
    }

    async fn custom_command(&self, ctx: &DeviceContext, name: &str, params: &Params) -> HandlerResult {
        match name {
            "add_user" => self.add_user(params),
            "add_card" => self.add_card(params),
            "close_door" => {
                ctx.set_attribute("is_open", json!(false));
                Ok(payload([("is_open", json!(false))]))
            }
            "reset_alarm" => {
                self.state.lock().unauthorized_attempts = 0;
                ctx.set_attribute("alarm_triggered", json!(false));
                Ok(payload([("alarm_triggered", json!(false))]))
            }
            _ => Err(CommandError::method_not_found(name)),
        }
    }
}
