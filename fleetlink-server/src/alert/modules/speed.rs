//! Fires when speed exceeds a configured limit for a sustained duration.

use chrono::Utc;
use fleetlink_core::alert_state::{AlertStateExt, HysteresisKeys};
use fleetlink_core::position::NormalizedPosition;
use fleetlink_core::alert_state::AlertState;

use crate::alert::{
    AlertContext, AlertDefinition, AlertField, AlertModule, AlertOutcome, AlertParams, AlertType,
    ParamsExt,
};
use crate::storage::models::AlertSeverity;

const TOPIC: &str = "speeding";

pub struct SpeedingAlert;

impl AlertModule for SpeedingAlert {
    fn definition(&self) -> AlertDefinition {
        AlertDefinition {
            key: "speed_tolerance",
            alert_type: AlertType::Speeding,
            label: "Speeding Alert",
            description: "Fires when the vehicle exceeds a speed limit for a sustained period.",
            icon: "🚗",
            severity: AlertSeverity::Warning,
            state_keys: &["speeding_since", "speeding_alerted"],
            fields: vec![
                AlertField {
                    key: "speed_limit",
                    label: "Speed Limit",
                    field_type: "number",
                    unit: Some("km/h"),
                    default: Some(100.0.into()),
                    min_value: Some(10.0),
                    max_value: Some(300.0),
                    options: &[],
                    required: true,
                    help_text: "Alert fires when speed exceeds this value.",
                },
                AlertField {
                    key: "duration_seconds",
                    label: "Sustained Duration",
                    field_type: "number",
                    unit: Some("seconds"),
                    default: Some(30.0.into()),
                    min_value: Some(0.0),
                    max_value: Some(3600.0),
                    options: &[],
                    required: true,
                    help_text: "How long the speed must stay above the limit before firing.",
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
        let limit = params.f64("speed_limit", 100.0);
        let duration_seconds = params.f64("duration_seconds", 30.0);
        let keys = HysteresisKeys { topic: TOPIC };

        let speed = position.speed.unwrap_or(0.0);

        if speed <= limit {
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

        let elapsed = (position.device_time - since).num_seconds() as f64;
        if elapsed < duration_seconds {
            return None;
        }

        if alert_state.get_bool(&keys.alerted()).unwrap_or(false) {
            return None;
        }

        alert_state.insert(keys.alerted(), true.into());
        Some(AlertOutcome {
            alert_type: AlertType::Speeding,
            severity: AlertSeverity::Warning,
            message: format!("Speeding: {speed:.0} km/h exceeds limit of {limit:.0} km/h."),
            metadata: serde_json::json!({
                "config_key": "speed_tolerance",
                "speed": speed,
                "limit": limit,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertParams;
    use crate::storage::models::{Device, DeviceState};
    use chrono::Duration;
    use fleetlink_core::position::Sensors;
    use uuid::Uuid;

    fn position_at(speed: f64, t: chrono::DateTime<Utc>) -> NormalizedPosition {
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
            ignition: Some(true),
            sensors: Sensors::new(),
            valid_fix: true,
            raw_data: None,
        }
    }

    fn ctx<'a>(device: &'a Device, state: &'a DeviceState) -> AlertContext<'a> {
        AlertContext {
            device,
            device_state: state,
            geofences: &[],
        }
    }

    #[test]
    fn requires_sustained_overspeed_before_firing() {
        let module = SpeedingAlert;
        let device = Device {
            id: Uuid::new_v4(),
            imei: "123".into(),
            protocol: "teltonika".into(),
            name: "test".into(),
            enabled: true,
        };
        let state = DeviceState::new(device.id);
        let mut alert_state = AlertState::new();
        let mut params = AlertParams::new();
        params.insert("speed_limit".into(), 80.0.into());
        params.insert("duration_seconds".into(), 30.0.into());

        let t0 = Utc::now();
        let c = ctx(&device, &state);
        assert!(module
            .check(&position_at(100.0, t0), &c, &mut alert_state, &params)
            .is_none());

        // Not enough time elapsed yet.
        let t1 = t0 + Duration::seconds(10);
        assert!(module
            .check(&position_at(100.0, t1), &c, &mut alert_state, &params)
            .is_none());

        let t2 = t0 + Duration::seconds(31);
        let outcome = module
            .check(&position_at(100.0, t2), &c, &mut alert_state, &params)
            .expect("should fire once sustained");
        assert_eq!(outcome.alert_type, AlertType::Speeding);

        // Already latched, should not refire.
        let t3 = t0 + Duration::seconds(40);
        assert!(module
            .check(&position_at(100.0, t3), &c, &mut alert_state, &params)
            .is_none());
    }

    #[test]
    fn resets_when_speed_drops() {
        let module = SpeedingAlert;
        let device = Device {
            id: Uuid::new_v4(),
            imei: "123".into(),
            protocol: "teltonika".into(),
            name: "test".into(),
            enabled: true,
        };
        let state = DeviceState::new(device.id);
        let c = ctx(&device, &state);
        let mut alert_state = AlertState::new();
        let mut params = AlertParams::new();
        params.insert("speed_limit".into(), 80.0.into());
        params.insert("duration_seconds".into(), 30.0.into());

        let t0 = Utc::now();
        module.check(&position_at(100.0, t0), &c, &mut alert_state, &params);
        module.check(&position_at(50.0, t0 + Duration::seconds(5)), &c, &mut alert_state, &params);
        assert!(alert_state.get_time("speeding_since").is_none());
    }
}
