//! Flespi newline-delimited JSON protocol decoder.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::position::{
    ClientInfo, CommandInfo, CommandParams, ControlEvent, DecodeOutcome, NormalizedPosition,
    SensorValue, Transport,
};
use crate::protocol::ProtocolDecoder;

pub struct FlespiDecoder;

fn get_nested<'a>(message: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| message.get(key))
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn json_to_sensor(value: &Value) -> Option<SensorValue> {
    match value {
        Value::Bool(b) => Some(SensorValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(SensorValue::Int(i))
            } else {
                n.as_f64().map(SensorValue::Float)
            }
        }
        Value::String(s) => Some(SensorValue::Text(s.clone())),
        _ => None,
    }
}

impl FlespiDecoder {
    fn parse_message(&self, message: &Value, known_imei: Option<&str>) -> Option<NormalizedPosition> {
        let imei = known_imei.map(str::to_string).or_else(|| {
            get_nested(message, &["ident", "device.ident"]).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })?;

        let device_time = get_nested(message, &["timestamp", "server.timestamp"])
            .and_then(as_f64)
            .map(unix_time_to_datetime)
            .unwrap_or_else(Utc::now);

        let latitude = as_f64(get_nested(message, &["position.latitude", "lat", "latitude"])?)?;
        let longitude = as_f64(get_nested(message, &["position.longitude", "lon", "longitude"])?)?;
        let altitude = get_nested(message, &["position.altitude", "alt", "altitude"]).and_then(as_f64);
        let speed = get_nested(message, &["position.speed", "speed"]).and_then(as_f64);
        let course = get_nested(message, &["position.direction", "course", "heading"]).and_then(as_f64);
        let satellites = get_nested(message, &["position.satellites", "sat", "satellites"])
            .and_then(as_f64)
            .map(|v| v as u8);
        let valid_fix = get_nested(message, &["position.valid", "valid"])
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut sensors: HashMap<String, SensorValue> = HashMap::new();
        let ignition = get_nested(message, &["engine.ignition.status", "ignition"]).and_then(Value::as_bool);
        if let Some(b) = ignition {
            sensors.insert("ignition".to_string(), SensorValue::Bool(b));
        }
        for (keys, name) in [
            (["battery.voltage", "battery_voltage"], "battery_voltage"),
            (["external.powersource.voltage", "external_voltage"], "external_voltage"),
            (["gnss.hdop", "hdop"], "hdop"),
            (["fuel.level", "fuel_level"], "fuel_level"),
            (["vehicle.mileage", "odometer"], "odometer"),
        ] {
            if let Some(v) = get_nested(message, &keys).and_then(as_f64) {
                sensors.insert(name.to_string(), SensorValue::Float(v));
            }
        }
        if let Some(v) = get_nested(message, &["gsm.signal.level", "rssi", "signal"]).and_then(as_f64) {
            sensors.insert("rssi".to_string(), SensorValue::Int(v as i64));
        }
        if let Some(v) = get_nested(message, &["engine.rpm", "rpm"]).and_then(as_f64) {
            sensors.insert("rpm".to_string(), SensorValue::Int(v as i64));
        }

        if let Value::Object(map) = message {
            for (key, value) in map {
                if matches!(key.as_str(), "ident" | "device.ident" | "timestamp" | "server.timestamp")
                    || key.starts_with("position.")
                    || sensors.contains_key(key)
                {
                    continue;
                }
                if let Some(sensor) = json_to_sensor(value) {
                    sensors.insert(key.clone(), sensor);
                }
            }
        }

        Some(
            NormalizedPosition {
                imei,
                device_time,
                server_time: Utc::now(),
                latitude,
                longitude,
                altitude,
                speed,
                course,
                satellites,
                hdop: sensors.get("hdop").and_then(SensorValue::as_f64),
                ignition,
                sensors,
                valid_fix,
                raw_data: None,
            }
            .sanitize(),
        )
    }
}

fn unix_time_to_datetime(timestamp: f64) -> DateTime<Utc> {
    if timestamp > 10_000_000_000.0 {
        Utc.timestamp_millis_opt(timestamp as i64).single()
    } else {
        Utc.timestamp_opt(timestamp as i64, 0).single()
    }
    .unwrap_or_else(Utc::now)
}

impl ProtocolDecoder for FlespiDecoder {
    fn name(&self) -> &'static str {
        "flespi"
    }

    fn port(&self) -> u16 {
        5149
    }

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn decode(
        &self,
        buf: &[u8],
        _client: &ClientInfo,
        known_imei: Option<&str>,
    ) -> (DecodeOutcome, usize) {
        if buf.is_empty() {
            return (DecodeOutcome::None, 0);
        }
        let Ok(text) = std::str::from_utf8(buf) else {
            return (DecodeOutcome::None, 1);
        };
        let Some(newline_idx) = text.find('\n') else {
            if buf.len() > 8192 {
                return (DecodeOutcome::None, buf.len());
            }
            return (DecodeOutcome::None, 0);
        };
        let json_str = text[..newline_idx].trim();
        let consumed = newline_idx + 1;
        if json_str.is_empty() {
            return (DecodeOutcome::None, consumed);
        }
        let Ok(message) = serde_json::from_str::<Value>(json_str) else {
            return (DecodeOutcome::None, consumed);
        };

        if let Some(ident) = message.get("ident").or_else(|| message.get("device.ident")) {
            if known_imei.is_none() {
                let ident = match ident {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                return (
                    DecodeOutcome::Control(ControlEvent {
                        event: "login".to_string(),
                        imei: Some(ident),
                        response_bytes: Some(b"{\"status\": \"ok\"}\n".to_vec()),
                        ..Default::default()
                    }),
                    consumed,
                );
            }
        }

        match &message {
            Value::Object(_) => match self.parse_message(&message, known_imei) {
                Some(position) => (DecodeOutcome::Position(position), consumed),
                None => (DecodeOutcome::None, consumed),
            },
            Value::Array(items) => {
                let mut positions = items
                    .iter()
                    .filter_map(|item| self.parse_message(item, known_imei));
                match positions.next() {
                    Some(first) => (
                        DecodeOutcome::Control(ControlEvent {
                            event: "position_batch".to_string(),
                            position: Some(first),
                            extra_positions: positions.collect(),
                            ..Default::default()
                        }),
                        consumed,
                    ),
                    None => (DecodeOutcome::None, consumed),
                }
            }
            _ => (DecodeOutcome::None, consumed),
        }
    }

    fn encode_command(&self, _command: &str, _params: &CommandParams) -> Vec<u8> {
        Vec::new()
    }

    fn available_commands(&self) -> &'static [&'static str] {
        &[]
    }

    fn command_info(&self, _name: &str) -> Option<CommandInfo> {
        None
    }

    fn max_buffer_size(&self) -> usize {
        8192
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientInfo {
        ClientInfo { ip: "127.0.0.1".to_string(), port: 5149 }
    }

    #[test]
    fn login_message_binds_ident() {
        let decoder = FlespiDecoder;
        let msg = "{\"ident\": \"123456789012345\"}\n";
        let (outcome, consumed) = decoder.decode(msg.as_bytes(), &client(), None);
        assert_eq!(consumed, msg.len());
        match outcome {
            DecodeOutcome::Control(ev) => assert_eq!(ev.event, "login"),
            other => panic!("expected login, got {other:?}"),
        }
    }

    #[test]
    fn telemetry_message_parses_position() {
        let decoder = FlespiDecoder;
        let msg = "{\"position.latitude\": 10.5, \"position.longitude\": 20.5, \"position.speed\": 30}\n";
        let (outcome, _consumed) = decoder.decode(msg.as_bytes(), &client(), Some("123456789012345"));
        match outcome {
            DecodeOutcome::Position(position) => {
                assert_eq!(position.latitude, 10.5);
                assert_eq!(position.speed, Some(30.0));
            }
            other => panic!("expected position, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_message_without_newline_waits() {
        let decoder = FlespiDecoder;
        let msg = b"{\"position.latitude\": 10.5";
        let (outcome, consumed) = decoder.decode(msg, &client(), Some("123"));
        assert_eq!(consumed, 0);
        assert_eq!(outcome, DecodeOutcome::None);
    }
}
