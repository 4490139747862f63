//! User-defined expression rules, evaluated via `fleetlink_core::expr`.
//!
//! Hidden from the add-alert dropdown — rows of this type are created
//! through the rule-builder UI, not picked from the module list. Each row
//! carries its own `name`/`rule`/`channels` at the top level rather than
//! inside `params` (see `AlertRow::effective_params`), and debounces on a
//! slug of the rule text so identical rule strings across devices don't
//! share state but repeated evaluation of the same row does.

use fleetlink_core::alert_state::{AlertState, AlertStateExt};
use fleetlink_core::expr::evaluate_rule;
use fleetlink_core::position::NormalizedPosition;

use crate::alert::{
    AlertContext, AlertDefinition, AlertField, AlertModule, AlertOutcome, AlertParams, AlertType,
    ParamsExt,
};
use crate::storage::models::AlertSeverity;

fn slug(rule: &str) -> String {
    rule.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

pub struct CustomRuleAlert;

impl AlertModule for CustomRuleAlert {
    fn definition(&self) -> AlertDefinition {
        AlertDefinition {
            key: "__custom__",
            alert_type: AlertType::Custom,
            label: "Custom Rule",
            description: "Fires when a user-defined rule expression evaluates to true.",
            icon: "⚡",
            severity: AlertSeverity::Warning,
            state_keys: &[],
            fields: vec![
                AlertField {
                    key: "name",
                    label: "Rule Name",
                    field_type: "text",
                    unit: None,
                    default: Some("".into()),
                    min_value: None,
                    max_value: None,
                    options: &[],
                    required: true,
                    help_text: "Human-readable name shown in alerts.",
                },
                AlertField {
                    key: "rule",
                    label: "Condition",
                    field_type: "text",
                    unit: None,
                    default: Some("".into()),
                    min_value: None,
                    max_value: None,
                    options: &[],
                    required: true,
                    help_text: "Rule expression, e.g. 'speed > 80 and ignition'.",
                },
            ],
            hidden: true,
        }
    }

    fn check(
        &self,
        position: &NormalizedPosition,
        _ctx: &AlertContext,
        alert_state: &mut AlertState,
        params: &AlertParams,
    ) -> Option<AlertOutcome> {
        let rule_str = params.str("rule").unwrap_or("").trim().to_string();
        if rule_str.is_empty() {
            return None;
        }
        let rule_name = params.str("name").unwrap_or("Custom Alert").to_string();
        let channels = params.string_vec("channels");
        let duration_seconds = params.get("duration").and_then(|v| v.as_f64());

        let fired_key = format!("c_fired_{}", slug(&rule_str));
        let since_key = format!("c_since_{}", slug(&rule_str));

        let matched = match evaluate_rule(&rule_str, position) {
            Ok(m) => m,
            Err(_) => return None,
        };

        if !matched {
            alert_state.remove(&since_key);
            alert_state.insert(fired_key, false.into());
            return None;
        }

        if let Some(duration_seconds) = duration_seconds {
            let since = match alert_state.get_time(&since_key) {
                Some(t) => t,
                None => {
                    alert_state.set_time(&since_key, position.device_time);
                    return None;
                }
            };
            if (position.device_time - since).num_seconds() < duration_seconds as i64 {
                return None;
            }
        }

        if alert_state.get_bool(&fired_key).unwrap_or(false) {
            return None;
        }
        alert_state.insert(fired_key, true.into());

        Some(AlertOutcome {
            alert_type: AlertType::Custom,
            severity: AlertSeverity::Warning,
            message: rule_name.clone(),
            metadata: serde_json::json!({
                "rule_name": rule_name,
                "rule_condition": rule_str,
                "selected_channels": channels,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{Device, DeviceState};
    use chrono::Utc;
    use fleetlink_core::position::Sensors;
    use uuid::Uuid;

    fn position_with_speed(speed: f64) -> NormalizedPosition {
        let t = Utc::now();
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

    #[test]
    fn fires_once_then_resets_on_false() {
        let module = CustomRuleAlert;
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
        params.insert("name".into(), "Hard braking".into());
        params.insert("rule".into(), "speed > 100".into());

        let fired = module
            .check(&position_with_speed(110.0), &ctx, &mut alert_state, &params)
            .expect("should fire");
        assert_eq!(fired.alert_type, AlertType::Custom);

        let not_refired = module.check(&position_with_speed(110.0), &ctx, &mut alert_state, &params);
        assert!(not_refired.is_none());

        module.check(&position_with_speed(50.0), &ctx, &mut alert_state, &params);
        let fired_again = module
            .check(&position_with_speed(110.0), &ctx, &mut alert_state, &params)
            .expect("should refire after reset");
        assert_eq!(fired_again.alert_type, AlertType::Custom);
    }

    #[test]
    fn invalid_rule_is_silently_ignored() {
        let module = CustomRuleAlert;
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
        params.insert("name".into(), "Broken".into());
        params.insert("rule".into(), "speed >>> 5".into());

        assert!(module
            .check(&position_with_speed(10.0), &ctx, &mut alert_state, &params)
            .is_none());
    }
}
