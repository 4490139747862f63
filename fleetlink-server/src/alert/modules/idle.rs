//! Fires when the engine idles (ignition on, near-zero speed) too long.

use fleetlink_core::alert_state::{AlertState, AlertStateExt, HysteresisKeys};
use fleetlink_core::position::NormalizedPosition;

use crate::alert::{
    AlertContext, AlertDefinition, AlertField, AlertModule, AlertOutcome, AlertParams, AlertType,
    ParamsExt,
};
use crate::storage::models::AlertSeverity;

const TOPIC: &str = "idling";

pub struct IdlingAlert;

impl AlertModule for IdlingAlert {
    fn definition(&self) -> AlertDefinition {
        AlertDefinition {
            key: "idle_timeout_minutes",
            alert_type: AlertType::Idling,
            label: "Idling Alert",
            description: "Fires when the vehicle idles with the ignition on for too long.",
            icon: "⏱️",
            severity: AlertSeverity::Info,
            state_keys: &["idling_since", "idling_alerted"],
            fields: vec![
                AlertField {
                    key: "timeout_minutes",
                    label: "Idle Timeout",
                    field_type: "number",
                    unit: Some("minutes"),
                    default: Some(10.0.into()),
                    min_value: Some(1.0),
                    max_value: Some(180.0),
                    options: &[],
                    required: true,
                    help_text: "Alert fires after the vehicle idles this long.",
                },
                AlertField {
                    key: "speed_threshold",
                    label: "Speed Threshold",
                    field_type: "number",
                    unit: Some("km/h"),
                    default: Some(2.0.into()),
                    min_value: Some(0.0),
                    max_value: Some(20.0),
                    options: &[],
                    required: false,
                    help_text: "Speed below this counts as stationary.",
                },
            ],
            hidden: false,
        }
    }

    fn check(
        &self,
        position: &NormalizedPosition,
        _ctx: &AlertContext,
        alert_state: &mut AlertState,
        params: &AlertParams,
    ) -> Option<AlertOutcome> {
        let timeout_minutes = params.f64("timeout_minutes", 10.0);
        let speed_threshold = params.f64("speed_threshold", 2.0);
        let keys = HysteresisKeys { topic: TOPIC };

        let ignition = position.ignition.unwrap_or(false);
        let speed = position.speed.unwrap_or(0.0);

        if !ignition || speed > speed_threshold {
            alert_state.remove(&keys.since());
            alert_state.insert(keys.alerted(), false.into());
            return None;
        }

        let since = match alert_state.get_time(&keys.since()) {
            Some(t) => t,
            None => {
                alert_state.set_time(&keys.since(), position.device_time);
                return None;
            }
        };

        let elapsed_minutes = (position.device_time - since).num_seconds() as f64 / 60.0;
        if elapsed_minutes < timeout_minutes {
            return None;
        }

        if alert_state.get_bool(&keys.alerted()).unwrap_or(false) {
            return None;
        }

        alert_state.insert(keys.alerted(), true.into());
        Some(AlertOutcome {
            alert_type: AlertType::Idling,
            severity: AlertSeverity::Info,
            message: format!("Idling for over {timeout_minutes:.0} minutes."),
            metadata: serde_json::json!({
                "config_key": "idle_timeout_minutes",
                "timeout_minutes": timeout_minutes,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{Device, DeviceState};
    use chrono::{Duration, Utc};
    use fleetlink_core::position::Sensors;
    use uuid::Uuid;

    fn position_at(ignition: bool, speed: f64, t: chrono::DateTime<Utc>) -> NormalizedPosition {
        NormalizedPosition {
            imei: "123".into(),
            device_time: t,
            server_time: t,
            latitude: 0.0,
            longitude: 0.0,
            altitude: None,
            speed: Some(speed),
            course: None,
            satellites: None,
            hdop: None,
            ignition: Some(ignition),
            sensors: Sensors::new(),
            valid_fix: true,
            raw_data: None,
        }
    }

    #[test]
    fn fires_after_sustained_idle_with_ignition_on() {
        let module = IdlingAlert;
        let device = Device {
            id: Uuid::new_v4(),
            imei: "123".into(),
            protocol: "teltonika".into(),
            name: "t".into(),
            enabled: true,
        };
        let state = DeviceState::new(device.id);
        let ctx = AlertContext {
            device: &device,
            device_state: &state,
            geofences: &[],
        };
        let mut alert_state = AlertState::new();
        let mut params = AlertParams::new();
        params.insert("timeout_minutes".into(), 10.0.into());
        params.insert("speed_threshold".into(), 2.0.into());

        let t0 = Utc::now();
        assert!(module
            .check(&position_at(true, 0.0, t0), &ctx, &mut alert_state, &params)
            .is_none());

        let t1 = t0 + Duration::minutes(11);
        let outcome = module
            .check(&position_at(true, 0.0, t1), &ctx, &mut alert_state, &params)
            .expect("should fire");
        assert_eq!(outcome.alert_type, AlertType::Idling);
    }

    #[test]
    fn does_not_fire_when_ignition_off() {
        let module = IdlingAlert;
        let device = Device {
            id: Uuid::new_v4(),
            imei: "123".into(),
            protocol: "teltonika".into(),
            name: "t".into(),
            enabled: true,
        };
        let state = DeviceState::new(device.id);
        let ctx = AlertContext {
            device: &device,
            device_state: &state,
            geofences: &[],
        };
        let mut alert_state = AlertState::new();
        let params = AlertParams::new();

        let t0 = Utc::now();
        assert!(module
            .check(&position_at(false, 0.0, t0), &ctx, &mut alert_state, &params)
            .is_none());
        assert!(alert_state.get_time("idling_since").is_none());
    }
}
