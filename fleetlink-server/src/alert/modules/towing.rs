//! Fires when the vehicle moves while parked (ignition off).

use fleetlink_core::alert_state::{AlertState, AlertStateExt, HysteresisKeys};
use fleetlink_core::geo::haversine_km;
use fleetlink_core::position::NormalizedPosition;

use crate::alert::{
    AlertContext, AlertDefinition, AlertField, AlertModule, AlertOutcome, AlertParams, AlertType,
    ParamsExt,
};
use crate::storage::models::AlertSeverity;

const TOPIC: &str = "towing";

pub struct TowingAlert;

impl AlertModule for TowingAlert {
    fn definition(&self) -> AlertDefinition {
        AlertDefinition {
            key: "towing_threshold_meters",
            alert_type: AlertType::Towing,
            label: "Towing Alert",
            description: "Fires when the vehicle moves significantly while the ignition is off.",
            icon: "🚨",
            severity: AlertSeverity::Critical,
            state_keys: &["towing_anchor_lat", "towing_anchor_lon", "towing_alerted"],
            fields: vec![
                AlertField {
                    key: "threshold_meters",
                    label: "Movement Threshold",
                    field_type: "number",
                    unit: Some("meters"),
                    default: Some(100.0.into()),
                    min_value: Some(10.0),
                    max_value: Some(1000.0),
                    options: &[],
                    required: true,
                    help_text: "Alert fires when the vehicle moves more than this distance from its parked position.",
                },
                AlertField {
                    key: "reset_on_ignition",
                    label: "Reset anchor when ignition turns on",
                    field_type: "checkbox",
                    unit: None,
                    default: Some(true.into()),
                    min_value: None,
                    max_value: None,
                    options: &[],
                    required: false,
                    help_text: "When enabled, the parked anchor is reset each time the ignition turns off.",
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
        let threshold_meters = params.f64("threshold_meters", 100.0);
        let reset_on_ignition = params.bool("reset_on_ignition", true);
        let keys = HysteresisKeys { topic: TOPIC };

        if position.ignition.unwrap_or(false) {
            if reset_on_ignition {
                alert_state.remove(&keys.anchor_lat());
                alert_state.remove(&keys.anchor_lon());
            }
            alert_state.insert(keys.alerted(), false.into());
            return None;
        }

        let anchor_lat = alert_state.get_f64(&keys.anchor_lat());
        let anchor_lon = alert_state.get_f64(&keys.anchor_lon());

        let (anchor_lat, anchor_lon) = match (anchor_lat, anchor_lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                alert_state.insert(keys.anchor_lat(), position.latitude.into());
                alert_state.insert(keys.anchor_lon(), position.longitude.into());
                return None;
            }
        };

        let dist_meters =
            haversine_km(anchor_lat, anchor_lon, position.latitude, position.longitude) * 1000.0;

        if dist_meters > threshold_meters && !alert_state.get_bool(&keys.alerted()).unwrap_or(false)
        {
            alert_state.insert(keys.alerted(), true.into());
            return Some(AlertOutcome {
                alert_type: AlertType::Towing,
                severity: AlertSeverity::Critical,
                message: format!("Towing Alert: Vehicle moved {}m while parked.", dist_meters as i64),
                metadata: serde_json::json!({ "config_key": "towing_threshold_meters" }),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{Device, DeviceState};
    use chrono::Utc;
    use fleetlink_core::position::Sensors;
    use uuid::Uuid;

    fn position_at(ignition: bool, lat: f64, lon: f64) -> NormalizedPosition {
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
            ignition: Some(ignition),
            sensors: Sensors::new(),
            valid_fix: true,
            raw_data: None,
        }
    }

    #[test]
    fn anchors_on_first_off_position_then_fires_on_drift() {
        let module = TowingAlert;
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
        params.insert("threshold_meters".into(), 50.0.into());
        params.insert("reset_on_ignition".into(), true.into());

        assert!(module
            .check(&position_at(false, 40.0, -74.0), &ctx, &mut alert_state, &params)
            .is_none());
        assert!(alert_state.get_f64("towing_anchor_lat").is_some());

        // ~1km away, well past the 50m threshold.
        let outcome = module
            .check(&position_at(false, 40.009, -74.0), &ctx, &mut alert_state, &params)
            .expect("should fire");
        assert_eq!(outcome.alert_type, AlertType::Towing);
    }

    #[test]
    fn ignition_on_resets_anchor() {
        let module = TowingAlert;
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
        params.insert("reset_on_ignition".into(), true.into());

        module.check(&position_at(false, 40.0, -74.0), &ctx, &mut alert_state, &params);
        module.check(&position_at(true, 40.0, -74.0), &ctx, &mut alert_state, &params);
        assert!(alert_state.get_f64("towing_anchor_lat").is_none());
    }
}
