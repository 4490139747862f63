//! Dispatch loop: per-position evaluation of a device's configured alert
//! rows, and the periodic sweep for time-triggered modules.

use chrono::{DateTime, Utc};
use fleetlink_core::position::NormalizedPosition;

use super::schedule::row_is_active;
use super::{AlertContext, AlertOutcome, AlertRegistry, AlertRow};
use crate::storage::models::{Device, DeviceState, Geofence};

pub struct AlertEngine {
    registry: AlertRegistry,
}

impl AlertEngine {
    pub fn new() -> Self {
        AlertEngine {
            registry: AlertRegistry::builtin(),
        }
    }

    /// Evaluates every enabled, in-schedule row against a freshly processed
    /// position. `state.alert_states` is mutated in place and always ends
    /// up persisted exactly once, regardless of how many rows fired.
    pub fn dispatch_position(
        &self,
        position: &NormalizedPosition,
        device: &Device,
        state: &mut DeviceState,
        rows: &[AlertRow],
        geofences: &[Geofence],
        now: DateTime<Utc>,
    ) -> Vec<AlertOutcome> {
        let mut fired = Vec::new();
        for row in rows {
            if !row.enabled || !row_is_active(&row.schedule, now) {
                continue;
            }
            let Some(module) = self.registry.get(&row.alert_key) else {
                log::warn!("no module registered for alert row (key={})", row.alert_key);
                continue;
            };
            let params = row.effective_params();

            let mut alert_state = std::mem::take(&mut state.alert_states);
            {
                let ctx = AlertContext {
                    device,
                    device_state: state,
                    geofences,
                };
                fired.extend(module.check_many(position, &ctx, &mut alert_state, &params));
            }
            state.alert_states = alert_state;
        }
        fired
    }

    /// Runs every row whose module implements `check_device`, invoked once
    /// per sweep tick for devices with no fresh position to hang an
    /// evaluation off of (offline detection's primary path).
    pub fn sweep_device(
        &self,
        device: &Device,
        state: &mut DeviceState,
        rows: &[AlertRow],
        geofences: &[Geofence],
        now: DateTime<Utc>,
    ) -> Vec<AlertOutcome> {
        let mut fired = Vec::new();
        for row in rows {
            if !row.enabled || !row_is_active(&row.schedule, now) {
                continue;
            }
            let Some(module) = self.registry.get(&row.alert_key) else {
                continue;
            };
            let params = row.effective_params();

            let mut alert_state = std::mem::take(&mut state.alert_states);
            {
                let ctx = AlertContext {
                    device,
                    device_state: state,
                    geofences,
                };
                if let Some(outcome) = module.check_device(&ctx, &mut alert_state, &params) {
                    fired.push(outcome);
                }
            }
            state.alert_states = alert_state;
        }
        fired
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::schedule::Schedule;
    use crate::storage::models::AlertSeverity;
    use chrono::TimeZone;
    use fleetlink_core::position::Sensors;
    use uuid::Uuid;

    fn device() -> Device {
        Device {
            id: Uuid::new_v4(),
            imei: "123".into(),
            protocol: "teltonika".into(),
            name: "t".into(),
            enabled: true,
        }
    }

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
    fn skips_rows_outside_their_schedule() {
        let engine = AlertEngine::new();
        let device = device();
        let mut state = DeviceState::new(device.id);
        let mut params = crate::alert::AlertParams::new();
        params.insert("speed_limit".into(), 10.0.into());
        params.insert("duration_seconds".into(), 0.0.into());

        let row = AlertRow {
            id: Uuid::new_v4(),
            device_id: device.id,
            alert_key: "speed_tolerance".into(),
            enabled: true,
            schedule: Some(Schedule {
                days: vec![0, 1, 2, 3, 4, 5, 6],
                hour_start: 23,
                hour_end: 23,
            }),
            params,
            name: None,
            rule: None,
            channels: vec![],
        };

        let now = chrono::Utc.with_ymd_and_hms(2026, 7, 26, 10, 0, 0).unwrap();
        let fired = engine.dispatch_position(
            &position_with_speed(100.0),
            &device,
            &mut state,
            &[row],
            &[],
            now,
        );
        assert!(fired.is_empty());
    }

    #[test]
    fn dispatches_to_registered_module_and_persists_state() {
        let engine = AlertEngine::new();
        let device = device();
        let mut state = DeviceState::new(device.id);
        let mut params = crate::alert::AlertParams::new();
        params.insert("speed_limit".into(), 10.0.into());
        params.insert("duration_seconds".into(), 0.0.into());

        let row = AlertRow {
            id: Uuid::new_v4(),
            device_id: device.id,
            alert_key: "speed_tolerance".into(),
            enabled: true,
            schedule: None,
            params,
            name: None,
            rule: None,
            channels: vec![],
        };

        let t0 = Utc::now();
        let first = engine.dispatch_position(
            &position_with_speed(100.0),
            &device,
            &mut state,
            &[row.clone()],
            &[],
            t0,
        );
        assert!(first.is_empty(), "first sighting only records the since-timestamp");

        let mut later = position_with_speed(100.0);
        later.device_time = t0 + chrono::Duration::seconds(5);
        let fired = engine.dispatch_position(&later, &device, &mut state, &[row], &[], t0);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].severity, AlertSeverity::Warning);
        assert!(state.alert_states.contains_key("speeding_alerted"));
    }
}
