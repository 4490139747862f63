//! Per-device, per-alert hysteresis state.
//!
//! Every alert module reads and writes a flat string-keyed map attached to
//! the device/alert pair it evaluates. Keeping it open (rather than a fixed
//! struct) lets each module own its own key convention without the engine
//! needing to know about them — `speed_tolerance` needs `<topic>_since` and
//! `<topic>_alerted`, `towing_threshold_meters` additionally needs
//! `<topic>_anchor_lat`/`<topic>_anchor_lon`/`<topic>_anchor_time`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::position::SensorValue;

/// The persisted hysteresis map for one (device, alert) pair.
pub type AlertState = HashMap<String, SensorValue>;

/// Convenience accessors shared by every built-in module's hysteresis logic.
pub trait AlertStateExt {
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_f64(&self, key: &str) -> Option<f64>;
    fn get_time(&self, key: &str) -> Option<DateTime<Utc>>;
    fn set_time(&mut self, key: &str, value: DateTime<Utc>);
}

impl AlertStateExt for AlertState {
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(SensorValue::as_bool)
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(SensorValue::as_f64)
    }

    fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.get(key) {
            Some(SensorValue::Text(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    fn set_time(&mut self, key: &str, value: DateTime<Utc>) {
        self.insert(key.to_string(), SensorValue::Text(value.to_rfc3339()));
    }
}

/// The standard "sustained condition" hysteresis keys a module built around
/// a `duration` threshold uses, named after the alert's topic (its unique
/// config key, e.g. `speed_tolerance` or a custom rule's id).
#[derive(Debug, Clone, Copy)]
pub struct HysteresisKeys<'a> {
    pub topic: &'a str,
}

impl<'a> HysteresisKeys<'a> {
    pub fn since(&self) -> String {
        format!("{}_since", self.topic)
    }

    pub fn alerted(&self) -> String {
        format!("{}_alerted", self.topic)
    }

    pub fn anchor_lat(&self) -> String {
        format!("{}_anchor_lat", self.topic)
    }

    pub fn anchor_lon(&self) -> String {
        format!("{}_anchor_lon", self.topic)
    }

    pub fn anchor_time(&self) -> String {
        format!("{}_anchor_time", self.topic)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SerializableAlertState(pub AlertState);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hysteresis_keys_are_namespaced_by_topic() {
        let keys = HysteresisKeys { topic: "speed_tolerance" };
        assert_eq!(keys.since(), "speed_tolerance_since");
        assert_eq!(keys.alerted(), "speed_tolerance_alerted");
    }

    #[test]
    fn state_roundtrips_time_through_rfc3339() {
        let mut state: AlertState = HashMap::new();
        let now = Utc::now();
        state.set_time("speeding_since", now);
        let recovered = state.get_time("speeding_since").unwrap();
        assert_eq!(recovered.timestamp(), now.timestamp());
    }
}
