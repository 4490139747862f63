//! Time-triggered module: fires when a device has gone quiet for too long.
//!
//! Not evaluated from the position path — the periodic sweep calls
//! `check_device` directly for every active row using this module.

use chrono::Utc;
use fleetlink_core::alert_state::{AlertState, AlertStateExt};

use crate::alert::{
    AlertContext, AlertDefinition, AlertField, AlertModule, AlertOutcome, AlertParams, AlertType,
    ParamsExt,
};
use crate::storage::models::AlertSeverity;

pub struct OfflineAlert;

impl AlertModule for OfflineAlert {
    fn definition(&self) -> AlertDefinition {
        AlertDefinition {
            key: "offline_detection",
            alert_type: AlertType::Offline,
            label: "Offline Detection",
            description: "Fires when the device has not reported for a configurable number of hours.",
            icon: "📴",
            severity: AlertSeverity::Warning,
            state_keys: &["offline_alerted"],
            fields: vec![AlertField {
                key: "timeout_hours",
                label: "Offline Timeout",
                field_type: "number",
                unit: Some("hours"),
                default: Some(24.0.into()),
                min_value: Some(1.0),
                max_value: Some(720.0),
                options: &[],
                required: true,
                help_text: "Alert fires when no data is received for this many hours.",
            }],
            hidden: false,
        }
    }

    fn check_device(
        &self,
        ctx: &AlertContext,
        alert_state: &mut AlertState,
        params: &AlertParams,
    ) -> Option<AlertOutcome> {
        let timeout_hours = params.f64("timeout_hours", 24.0);

        let last_seen = ctx.device_state.last_seen?;
        let elapsed_hours = (Utc::now() - last_seen).num_seconds() as f64 / 3600.0;

        if elapsed_hours < timeout_hours {
            alert_state.insert("offline_alerted".to_string(), false.into());
            return None;
        }

        if alert_state.get_bool("offline_alerted").unwrap_or(false) {
            return None;
        }

        alert_state.insert("offline_alerted".to_string(), true.into());
        Some(AlertOutcome {
            alert_type: AlertType::Offline,
            severity: AlertSeverity::Warning,
            message: format!("Device offline for over {timeout_hours:.0}h."),
            metadata: serde_json::json!({
                "config_key": "offline_detection",
                "timeout_hours": timeout_hours,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{Device, DeviceState};
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn fires_once_past_timeout_then_resets_on_recovery() {
        let module = OfflineAlert;
        let device = Device {
            id: Uuid::new_v4(),
            imei: "123".into(),
            protocol: "teltonika".into(),
            name: "t".into(),
            enabled: true,
        };
        let mut state = DeviceState::new(device.id);
        state.last_seen = Some(Utc::now() - Duration::hours(25));
        let ctx = AlertContext {
            device: &device,
            device_state: &state,
            geofences: &[],
        };
        let mut alert_state = AlertState::new();
        let mut params = AlertParams::new();
        params.insert("timeout_hours".into(), 24.0.into());

        let outcome = module
            .check_device(&ctx, &mut alert_state, &params)
            .expect("should fire");
        assert_eq!(outcome.alert_type, AlertType::Offline);

        assert!(module.check_device(&ctx, &mut alert_state, &params).is_none());

        state.last_seen = Some(Utc::now());
        let ctx2 = AlertContext {
            device: &device,
            device_state: &state,
            geofences: &[],
        };
        assert!(module.check_device(&ctx2, &mut alert_state, &params).is_none());
        assert_eq!(alert_state.get_bool("offline_alerted"), Some(false));
    }
}
