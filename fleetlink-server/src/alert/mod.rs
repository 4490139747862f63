//! Alert module contract, registry and dispatch engine.
//!
//! Mirrors the original system's `BaseAlert`/`AlertDefinition` split: a
//! module declares its configurable fields once via `definition()`, and
//! evaluates itself against a position (or, for time-triggered modules,
//! against device state alone) via `check()`/`check_device()`. All
//! persistent state a module needs between calls lives in the device's flat
//! `alert_states` map — the engine never interprets those keys itself.

pub mod engine;
pub mod modules;
pub mod schedule;

use std::collections::HashMap;

use fleetlink_core::alert_state::AlertState;
use fleetlink_core::position::{NormalizedPosition, SensorValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::models::{AlertSeverity, Device, DeviceState, Geofence};

pub use schedule::Schedule;

/// What kind of alert fired, independent of module identity (a geofence
/// module can fire either `GeofenceEnter` or `GeofenceExit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Speeding,
    Idling,
    Towing,
    GeofenceEnter,
    GeofenceExit,
    Maintenance,
    Offline,
    Custom,
}

/// One configurable parameter of an alert module.
#[derive(Debug, Clone)]
pub struct AlertField {
    pub key: &'static str,
    pub label: &'static str,
    pub field_type: &'static str,
    pub unit: Option<&'static str>,
    pub default: Option<SensorValue>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub options: &'static [(&'static str, &'static str)],
    pub required: bool,
    pub help_text: &'static str,
}

impl AlertField {
    pub fn new(key: &'static str, label: &'static str) -> Self {
        AlertField {
            key,
            label,
            field_type: "number",
            unit: None,
            default: None,
            min_value: None,
            max_value: None,
            options: &[],
            required: true,
            help_text: "",
        }
    }
}

/// Static description of a module, used by the (out-of-scope) frontend to
/// render its configuration form and by the engine to seed row defaults.
#[derive(Debug, Clone)]
pub struct AlertDefinition {
    pub key: &'static str,
    pub alert_type: AlertType,
    pub label: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
    pub severity: AlertSeverity,
    pub state_keys: &'static [&'static str],
    pub fields: Vec<AlertField>,
    pub hidden: bool,
}

impl AlertDefinition {
    pub fn primary_field(&self) -> Option<&AlertField> {
        self.fields.first()
    }

    pub fn default_params(&self) -> AlertParams {
        self.fields
            .iter()
            .filter_map(|f| f.default.clone().map(|d| (f.key.to_string(), d)))
            .collect()
    }
}

/// A fired alert, before it is turned into an `AlertHistory` row and
/// dispatched to the bus/notifier.
#[derive(Debug, Clone)]
pub struct AlertOutcome {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub metadata: serde_json::Value,
}

/// Row-scoped parameters, keyed the same way `AlertRow.params` is on the
/// original records (and what `encode_command`'s `CommandParams` already
/// uses for the downlink side).
pub type AlertParams = HashMap<String, SensorValue>;

pub trait ParamsExt {
    fn f64(&self, key: &str, default: f64) -> f64;
    fn bool(&self, key: &str, default: bool) -> bool;
    fn str(&self, key: &str) -> Option<&str>;
    fn string_vec(&self, key: &str) -> Vec<String>;
}

impl ParamsExt for AlertParams {
    fn f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(SensorValue::as_f64).unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(SensorValue::as_bool).unwrap_or(default)
    }

    fn str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(SensorValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn string_vec(&self, key: &str) -> Vec<String> {
        // Channels arrive as a JSON array folded into params by the caller;
        // a bare text value is treated as a single-element list.
        match self.get(key) {
            Some(SensorValue::Text(s)) if !s.is_empty() => {
                s.split(',').map(|p| p.trim().to_string()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Everything a module needs about the device beyond the triggering
/// position. Geofences are passed in rather than fetched by the module so
/// modules stay free of storage dependencies.
pub struct AlertContext<'a> {
    pub device: &'a Device,
    pub device_state: &'a DeviceState,
    pub geofences: &'a [Geofence],
}

/// One alert type's evaluation logic.
///
/// `check` is the position-triggered path; `check_many` lets a module fan
/// out to several events per position (geofences: one per crossed zone);
/// `check_device` is the time-triggered path invoked by the periodic sweep
/// for modules with no per-position signal (offline detection).
pub trait AlertModule: Send + Sync {
    fn definition(&self) -> AlertDefinition;

    fn check(
        &self,
        _position: &NormalizedPosition,
        _ctx: &AlertContext,
        _alert_state: &mut AlertState,
        _params: &AlertParams,
    ) -> Option<AlertOutcome> {
        None
    }

    fn check_many(
        &self,
        position: &NormalizedPosition,
        ctx: &AlertContext,
        alert_state: &mut AlertState,
        params: &AlertParams,
    ) -> Vec<AlertOutcome> {
        self.check(position, ctx, alert_state, params)
            .into_iter()
            .collect()
    }

    fn check_device(
        &self,
        _ctx: &AlertContext,
        _alert_state: &mut AlertState,
        _params: &AlertParams,
    ) -> Option<AlertOutcome> {
        None
    }
}

/// A device's configured instance of a module: which key, what params,
/// when it's allowed to fire, and (for `__custom__` only) the row-level
/// name/rule/channels fields that live outside `params` on the original
/// schema.
#[derive(Debug, Clone)]
pub struct AlertRow {
    pub id: Uuid,
    pub device_id: Uuid,
    pub alert_key: String,
    pub enabled: bool,
    pub schedule: Option<Schedule>,
    pub params: AlertParams,
    pub name: Option<String>,
    pub rule: Option<String>,
    pub channels: Vec<String>,
}

impl TryFrom<crate::storage::models::AlertRowRecord> for AlertRow {
    type Error = serde_json::Error;

    fn try_from(row: crate::storage::models::AlertRowRecord) -> Result<Self, Self::Error> {
        let schedule = row.schedule.map(serde_json::from_value).transpose()?;
        let params: AlertParams = serde_json::from_value(row.params)?;
        let channels: Vec<String> = serde_json::from_value(row.channels).unwrap_or_default();
        Ok(AlertRow {
            id: row.id,
            device_id: row.device_id,
            alert_key: row.alert_key,
            enabled: row.enabled,
            schedule,
            params,
            name: row.name,
            rule: row.rule,
            channels,
        })
    }
}

impl AlertRow {
    /// Builds the params map a module's `check`/`check_device` sees,
    /// folding the `__custom__` row's top-level fields in as params the
    /// same way the original's dispatch loop does.
    pub fn effective_params(&self) -> AlertParams {
        if self.alert_key == "__custom__" {
            let mut params = AlertParams::new();
            if let Some(name) = &self.name {
                params.insert("name".to_string(), SensorValue::Text(name.clone()));
            }
            if let Some(rule) = &self.rule {
                params.insert("rule".to_string(), SensorValue::Text(rule.clone()));
            }
            if !self.channels.is_empty() {
                params.insert(
                    "channels".to_string(),
                    SensorValue::Text(self.channels.join(",")),
                );
            }
            params
        } else {
            self.params.clone()
        }
    }
}

/// Startup-time registry of every known module, keyed by `definition().key`.
pub struct AlertRegistry {
    modules: HashMap<&'static str, Box<dyn AlertModule>>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        AlertRegistry {
            modules: HashMap::new(),
        }
    }

    pub fn register(&mut self, module: Box<dyn AlertModule>) {
        let key = module.definition().key;
        self.modules.insert(key, module);
    }

    pub fn get(&self, key: &str) -> Option<&dyn AlertModule> {
        self.modules.get(key).map(|m| m.as_ref())
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }

    /// The seven built-in modules, registered in the same order the
    /// frontend's "Add System Alert" dropdown lists them.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(modules::speed::SpeedingAlert));
        registry.register(Box::new(modules::idle::IdlingAlert));
        registry.register(Box::new(modules::towing::TowingAlert));
        registry.register(Box::new(modules::geofence::GeofenceAlert));
        registry.register(Box::new(modules::maintenance::MaintenanceAlert));
        registry.register(Box::new(modules::offline::OfflineAlert));
        registry.register(Box::new(modules::custom_rule::CustomRuleAlert));
        registry
    }
}

impl Default for AlertRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
