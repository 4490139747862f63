//! Fires on enter/exit crossings of a configured geofence.
//!
//! Unlike the other modules this one fans out: a single row can reference
//! a specific geofence, or (if `geofence_id` is unset) every geofence
//! registered for the device, each tracked independently.

use fleetlink_core::alert_state::{AlertState, AlertStateExt};
use fleetlink_core::position::NormalizedPosition;

use crate::alert::{
    AlertContext, AlertDefinition, AlertField, AlertModule, AlertOutcome, AlertParams, AlertType,
    ParamsExt,
};
use crate::storage::models::AlertSeverity;

pub struct GeofenceAlert;

impl AlertModule for GeofenceAlert {
    fn definition(&self) -> AlertDefinition {
        AlertDefinition {
            key: "geofence_alert",
            // The actual direction is decided per crossing in check_many.
            alert_type: AlertType::GeofenceEnter,
            label: "Geofence Alert",
            description: "Fires when the vehicle enters or exits a specific geofence.",
            icon: "📍",
            severity: AlertSeverity::Warning,
            state_keys: &[],
            fields: vec![
                AlertField {
                    key: "geofence_id",
                    label: "Geofence",
                    field_type: "select",
                    unit: None,
                    default: None,
                    min_value: None,
                    max_value: None,
                    options: &[],
                    required: true,
                    help_text: "The geofence to monitor.",
                },
                AlertField {
                    key: "event_type",
                    label: "Trigger On",
                    field_type: "select",
                    unit: None,
                    default: Some("both".into()),
                    min_value: None,
                    max_value: None,
                    options: &[("enter", "Enter only"), ("exit", "Exit only"), ("both", "Enter & Exit")],
                    required: true,
                    help_text: "Which crossing direction triggers the alert.",
                },
            ],
            hidden: false,
        }
    }

    fn check_many(
        &self,
        position: &NormalizedPosition,
        ctx: &AlertContext,
        alert_state: &mut AlertState,
        params: &AlertParams,
    ) -> Vec<AlertOutcome> {
        let geofence_id_filter = params.str("geofence_id").map(|s| s.to_string());
        let event_type = params.str("event_type").unwrap_or("both").to_string();

        let mut alerts = Vec::new();

        for fence in ctx.geofences {
            if let Some(filter) = &geofence_id_filter {
                if filter != &fence.id.to_string() {
                    continue;
                }
            }

            let inside_key = format!("geofence_{}_inside", fence.id);
            let was_inside = alert_state.get_bool(&inside_key).unwrap_or(false);
            let is_inside = fence.shape.contains(position.latitude, position.longitude);
            alert_state.insert(inside_key, is_inside.into());

            if was_inside == is_inside {
                continue;
            }

            let direction = if is_inside { "enter" } else { "exit" };
            if is_inside && !fence.alert_on_enter {
                continue;
            }
            if !is_inside && !fence.alert_on_exit {
                continue;
            }
            if event_type != "both" && event_type != direction {
                continue;
            }

            let alert_type = if is_inside {
                AlertType::GeofenceEnter
            } else {
                AlertType::GeofenceExit
            };
            let verb = if is_inside { "Entered" } else { "Exited" };

            alerts.push(AlertOutcome {
                alert_type,
                severity: AlertSeverity::Warning,
                message: format!("Geofence {verb}: {}", fence.name),
                metadata: serde_json::json!({
                    "geofence_id": fence.id,
                    "geofence_name": fence.name,
                    "event": direction,
                }),
            });
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{Device, DeviceState, Geofence};
    use chrono::Utc;
    use fleetlink_core::geo::Geofence as GeofenceShape;
    use fleetlink_core::position::Sensors;
    use uuid::Uuid;

    fn position_at(lat: f64, lon: f64) -> NormalizedPosition {
        let t = Utc::now();
        NormalizedPosition {
            imei: "123".into(),
            device_time: t,
            server_time: t,
            latitude: lat,
            longitude: lon,
            altitude: None,
            speed: Some(0.0),
            course: None,
            satellites: None,
            hdop: None,
            ignition: Some(true),
            sensors: Sensors::new(),
            valid_fix: true,
            raw_data: None,
        }
    }

    #[test]
    fn fires_enter_then_exit_exactly_once_each() {
        let module = GeofenceAlert;
        let device = Device {
            id: Uuid::new_v4(),
            imei: "123".into(),
            protocol: "teltonika".into(),
            name: "t".into(),
            enabled: true,
        };
        let state = DeviceState::new(device.id);
        let fence = Geofence {
            id: Uuid::new_v4(),
            device_id: Some(device.id),
            name: "Depot".into(),
            shape: GeofenceShape::Circle {
                center_lat: 40.0,
                center_lon: -74.0,
                radius_km: 1.0,
            },
            alert_on_enter: true,
            alert_on_exit: true,
            is_active: true,
        };
        let geofences = vec![fence];
        let ctx = AlertContext {
            device: &device,
            device_state: &state,
            geofences: &geofences,
        };
        let mut alert_state = AlertState::new();
        let params = AlertParams::new();

        // Outside initially.
        let outside = module.check_many(&position_at(50.0, -74.0), &ctx, &mut alert_state, &params);
        assert!(outside.is_empty());

        // Enter.
        let entered = module.check_many(&position_at(40.0, -74.0), &ctx, &mut alert_state, &params);
        assert_eq!(entered.len(), 1);
        assert_eq!(entered[0].alert_type, AlertType::GeofenceEnter);

        // Still inside: no refire.
        let still_in = module.check_many(&position_at(40.001, -74.0), &ctx, &mut alert_state, &params);
        assert!(still_in.is_empty());

        // Exit.
        let exited = module.check_many(&position_at(50.0, -74.0), &ctx, &mut alert_state, &params);
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0].alert_type, AlertType::GeofenceExit);
    }

    #[test]
    fn alert_on_enter_false_suppresses_entry_but_not_exit() {
        let module = GeofenceAlert;
        let device = Device {
            id: Uuid::new_v4(),
            imei: "123".into(),
            protocol: "teltonika".into(),
            name: "t".into(),
            enabled: true,
        };
        let state = DeviceState::new(device.id);
        let fence = Geofence {
            id: Uuid::new_v4(),
            device_id: Some(device.id),
            name: "Depot".into(),
            shape: GeofenceShape::Circle {
                center_lat: 40.0,
                center_lon: -74.0,
                radius_km: 1.0,
            },
            alert_on_enter: false,
            alert_on_exit: true,
            is_active: true,
        };
        let geofences = vec![fence];
        let ctx = AlertContext {
            device: &device,
            device_state: &state,
            geofences: &geofences,
        };
        let mut alert_state = AlertState::new();
        let params = AlertParams::new();

        let entered = module.check_many(&position_at(40.0, -74.0), &ctx, &mut alert_state, &params);
        assert!(entered.is_empty(), "entry alerting is disabled for this geofence");

        let exited = module.check_many(&position_at(50.0, -74.0), &ctx, &mut alert_state, &params);
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0].alert_type, AlertType::GeofenceExit);
    }
}
