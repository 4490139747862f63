//! Row types persisted by the storage layer.

use chrono::{DateTime, Utc};
use fleetlink_core::alert_state::AlertState;
use fleetlink_core::geo::Geofence as GeofenceShape;
use fleetlink_core::{NormalizedPosition, SensorValue};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub imei: String,
    pub protocol: String,
    pub name: String,
    pub enabled: bool,
}

/// Mutable runtime state for a device: last known position, odometer,
/// trip status, and the alert hysteresis map.
///
/// `alert_states` is a single flat map shared by every alert row on the
/// device, not one map per row — modules namespace their own keys by topic
/// (`speeding_since`, `towing_anchor_lat`, `geofence_<id>_enter`, …) so
/// unrelated modules never collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: Uuid,
    pub last_position: Option<NormalizedPosition>,
    /// Lifetime distance travelled — what `maintenance_alert` tracks against.
    pub odometer_km: f64,
    /// Distance travelled since `current_trip_id` opened; reset to zero on
    /// every ignition off→on transition.
    pub trip_odometer_km: f64,
    pub current_trip_id: Option<Uuid>,
    pub last_ignition: Option<bool>,
    pub last_seen: Option<DateTime<Utc>>,
    pub alert_states: AlertState,
}

impl DeviceState {
    pub fn new(device_id: Uuid) -> Self {
        Self {
            device_id,
            last_position: None,
            odometer_km: 0.0,
            trip_odometer_km: 0.0,
            current_trip_id: None,
            last_ignition: None,
            last_seen: None,
            alert_states: AlertState::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PositionRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub device_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub sensors: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trip {
    pub id: Uuid,
    pub device_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub distance_km: f64,
    pub start_latitude: f64,
    pub start_longitude: f64,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geofence {
    pub id: Uuid,
    /// `None` means a global geofence, evaluated against every device.
    pub device_id: Option<Uuid>,
    pub name: String,
    pub shape: GeofenceShape,
    pub alert_on_enter: bool,
    pub alert_on_exit: bool,
    pub is_active: bool,
}

/// Raw row shape for a geofence as stored (the shape column is JSON).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GeofenceRecord {
    pub id: Uuid,
    pub device_id: Option<Uuid>,
    pub name: String,
    pub shape: Json,
    pub alert_on_enter: bool,
    pub alert_on_exit: bool,
    pub is_active: bool,
}

impl GeofenceRecord {
    pub fn into_geofence(self) -> Result<Geofence, serde_json::Error> {
        Ok(Geofence {
            id: self.id,
            device_id: self.device_id,
            name: self.name,
            shape: serde_json::from_value(self.shape)?,
            alert_on_enter: self.alert_on_enter,
            alert_on_exit: self.alert_on_exit,
            is_active: self.is_active,
        })
    }
}

/// Raw row shape for a configured alert instance. `schedule`/`params`/
/// `channels` are stored as JSON since their shape is alert-module-specific
/// (or, for schedule, optional).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertRowRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub alert_key: String,
    pub enabled: bool,
    pub schedule: Option<Json>,
    pub params: Json,
    pub name: Option<String>,
    pub rule: Option<String>,
    pub channels: Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// One row per (user, alert-event) pair — `record_alert` is called once per
/// recipient, not once per alert firing.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertHistory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub alert_key: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub metadata: Json,
    pub is_read: bool,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A device's owning user together with the channels notifications for
/// that user should be attempted on.
#[derive(Debug, Clone)]
pub struct NotificationRecipient {
    pub user_id: Uuid,
    pub channels: Vec<crate::notify::NotificationChannel>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acked,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedCommand {
    pub id: Uuid,
    pub device_id: Uuid,
    pub command: String,
    pub params: Json,
    pub status: CommandStatus,
    pub retries: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

pub fn sensor_map_to_json(sensors: &std::collections::HashMap<String, SensorValue>) -> Json {
    serde_json::to_value(sensors).unwrap_or(Json::Null)
}
