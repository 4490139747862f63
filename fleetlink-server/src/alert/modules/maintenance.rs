//! Fires when an odometer-based service interval is approaching.

use fleetlink_core::alert_state::{AlertState, AlertStateExt};
use fleetlink_core::position::NormalizedPosition;

use crate::alert::{
    AlertContext, AlertDefinition, AlertField, AlertModule, AlertOutcome, AlertParams, AlertType,
    ParamsExt,
};
use crate::storage::models::AlertSeverity;

pub struct MaintenanceAlert;

impl AlertModule for MaintenanceAlert {
    fn definition(&self) -> AlertDefinition {
        AlertDefinition {
            key: "maintenance_alert",
            alert_type: AlertType::Maintenance,
            label: "Maintenance Due",
            description: "Fires when a maintenance interval is approaching.",
            icon: "🔧",
            severity: AlertSeverity::Info,
            state_keys: &[],
            fields: vec![
                AlertField {
                    key: "maintenance_type",
                    label: "Maintenance Type",
                    field_type: "select",
                    unit: None,
                    default: Some("oil_change".into()),
                    min_value: None,
                    max_value: None,
                    options: &[
                        ("oil_change", "Oil Change"),
                        ("tire_rotation", "Tire Rotation"),
                        ("brake_service", "Brake Service"),
                        ("air_filter", "Air Filter"),
                        ("custom", "Custom"),
                    ],
                    required: true,
                    help_text: "Which maintenance interval to track.",
                },
                AlertField {
                    key: "interval_km",
                    label: "Service Interval",
                    field_type: "number",
                    unit: Some("km"),
                    default: Some(10000.0.into()),
                    min_value: Some(100.0),
                    max_value: Some(100000.0),
                    options: &[],
                    required: true,
                    help_text: "How often (in km) this service is due.",
                },
                AlertField {
                    key: "warning_km",
                    label: "Warn When Within",
                    field_type: "number",
                    unit: Some("km"),
                    default: Some(500.0.into()),
                    min_value: Some(50.0),
                    max_value: Some(2000.0),
                    options: &[],
                    required: false,
                    help_text: "Start alerting when this many km remain before the service is due.",
                },
                AlertField {
                    key: "custom_label",
                    label: "Custom Label",
                    field_type: "text",
                    unit: None,
                    default: Some("".into()),
                    min_value: None,
                    max_value: None,
                    options: &[],
                    required: false,
                    help_text: "Used as the alert name when type is 'Custom'.",
                },
            ],
            hidden: false,
        }
    }

    fn check(
        &self,
        _position: &NormalizedPosition,
        ctx: &AlertContext,
        alert_state: &mut AlertState,
        params: &AlertParams,
    ) -> Option<AlertOutcome> {
        let mtype = params.str("maintenance_type").unwrap_or("oil_change");
        let interval_km = params.f64("interval_km", 10000.0);
        let warning_km = params.f64("warning_km", 500.0);
        let label = match params.str("custom_label") {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => mtype.replace('_', " "),
        };

        if interval_km <= 0.0 {
            return None;
        }

        let odometer = ctx.device_state.odometer_km;
        let remaining = interval_km - (odometer % interval_km);
        let alerted_key = format!("maint_{mtype}_alerted");

        if remaining > 0.0 && remaining <= warning_km {
            if alert_state.get_bool(&alerted_key).unwrap_or(false) {
                return None;
            }
            alert_state.insert(alerted_key, true.into());
            return Some(AlertOutcome {
                alert_type: AlertType::Maintenance,
                severity: AlertSeverity::Info,
                message: format!("Maintenance: {label} due in {} km.", remaining as i64),
                metadata: serde_json::json!({
                    "maintenance_type": mtype,
                    "remaining_km": remaining as i64,
                }),
            });
        } else if remaining > warning_km {
            alert_state.insert(alerted_key, false.into());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{Device, DeviceState};
    use fleetlink_core::position::Sensors;
    use chrono::Utc;
    use uuid::Uuid;

    fn dummy_position() -> NormalizedPosition {
        let t = Utc::now();
        NormalizedPosition {
            imei: "123".into(),
            device_time: t,
            server_time: t,
            latitude: 0.0,
            longitude: 0.0,
            altitude: None,
            speed: None,
            course: None,
            satellites: None,
            hdop: None,
            ignition: None,
            sensors: Sensors::new(),
            valid_fix: true,
            raw_data: None,
        }
    }

    #[test]
    fn fires_once_within_warning_window() {
        let module = MaintenanceAlert;
        let device = Device {
            id: Uuid::new_v4(),
            imei: "123".into(),
            protocol: "teltonika".into(),
            name: "t".into(),
            enabled: true,
        };
        let mut state = DeviceState::new(device.id);
        state.odometer_km = 9800.0; // 200 km remaining of a 10,000 km interval
        let ctx = AlertContext {
            device: &device,
            device_state: &state,
            geofences: &[],
        };
        let mut alert_state = AlertState::new();
        let mut params = AlertParams::new();
        params.insert("maintenance_type".into(), "oil_change".into());
        params.insert("interval_km".into(), 10000.0.into());
        params.insert("warning_km".into(), 500.0.into());

        let outcome = module
            .check(&dummy_position(), &ctx, &mut alert_state, &params)
            .expect("should fire");
        assert_eq!(outcome.alert_type, AlertType::Maintenance);

        let again = module.check(&dummy_position(), &ctx, &mut alert_state, &params);
        assert!(again.is_none());
    }
}
