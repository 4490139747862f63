//! Queclink `+RESP:GTxxx,...$` ASCII protocol decoder, fixed field layout.

use std::collections::HashMap;

use chrono::{TimeZone, Utc};

use crate::position::{
    ClientInfo, CommandInfo, CommandParams, DecodeOutcome, NormalizedPosition, SensorValue,
    Transport,
};
use crate::protocol::ProtocolDecoder;

const F_IMEI: usize = 1;
const F_STATE: usize = 3;
const F_HDOP: usize = 7;
const F_SPEED: usize = 8;
const F_COURSE: usize = 9;
const F_ALTITUDE: usize = 10;
const F_LON: usize = 11;
const F_LAT: usize = 12;
const F_TIMESTAMP: usize = 13;
const F_MCC: usize = 14;
const F_MNC: usize = 15;
const F_LAC: usize = 16;
const F_CELL_ID: usize = 17;

pub struct QueclinkDecoder;

impl QueclinkDecoder {
    fn parse_position(
        &self,
        fields: &[&str],
        msg_type: &str,
        known_imei: Option<&str>,
    ) -> Option<NormalizedPosition> {
        if fields.len() <= F_LAT {
            return None;
        }
        let imei = known_imei
            .map(str::to_string)
            .or_else(|| fields.get(F_IMEI).map(|s| s.trim().to_string()))?;

        let mut ignition = None;
        if let Some(state_str) = fields.get(F_STATE).map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if let Ok(state) = i64::from_str_radix(state_str, 16) {
                ignition = Some(state & 0x01 != 0);
            }
        }

        let latitude: f64 = fields.get(F_LAT)?.trim().parse().ok()?;
        let longitude: f64 = fields.get(F_LON)?.trim().parse().ok()?;

        let f = |idx: usize| -> f64 {
            fields
                .get(idx)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0)
        };
        let speed = f(F_SPEED);
        let course = f(F_COURSE);
        let altitude = f(F_ALTITUDE);
        let hdop = f(F_HDOP);

        let device_time = fields
            .get(F_TIMESTAMP)
            .map(|s| s.trim())
            .filter(|s| s.len() >= 14)
            .and_then(|ts| {
                Some((
                    ts[0..4].parse::<i32>().ok()?,
                    ts[4..6].parse::<u32>().ok()?,
                    ts[6..8].parse::<u32>().ok()?,
                    ts[8..10].parse::<u32>().ok()?,
                    ts[10..12].parse::<u32>().ok()?,
                    ts[12..14].parse::<u32>().ok()?,
                ))
            })
            .and_then(|(y, mo, d, h, mi, s)| Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single())
            .unwrap_or_else(Utc::now);

        let mut sensors: HashMap<String, SensorValue> =
            HashMap::from([("message_type".to_string(), SensorValue::Text(msg_type.to_string()))]);
        if hdop != 0.0 {
            sensors.insert("hdop".to_string(), SensorValue::Float(hdop));
        }
        for (idx, key) in [(F_MCC, "mcc"), (F_MNC, "mnc"), (F_LAC, "lac"), (F_CELL_ID, "cell_id")] {
            if let Some(v) = fields.get(idx).map(|s| s.trim()).filter(|s| !s.is_empty()) {
                sensors.insert(key.to_string(), SensorValue::Text(v.to_string()));
            }
        }
        if let Some(v) = fields.first().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            sensors.insert("protocol_version".to_string(), SensorValue::Text(v.to_string()));
        }
        if let Some(v) = fields.get(2).map(|s| s.trim()).filter(|s| !s.is_empty()) {
            sensors.insert("device_name".to_string(), SensorValue::Text(v.to_string()));
        }

        Some(
            NormalizedPosition {
                imei,
                device_time,
                server_time: Utc::now(),
                latitude,
                longitude,
                altitude: Some(altitude),
                speed: Some(speed),
                course: Some(course),
                satellites: None,
                hdop: Some(hdop),
                ignition,
                sensors,
                valid_fix: true,
                raw_data: None,
            }
            .sanitize(),
        )
    }
}

impl ProtocolDecoder for QueclinkDecoder {
    fn name(&self) -> &'static str {
        "queclink"
    }

    fn port(&self) -> u16 {
        5026
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
        let text = String::from_utf8_lossy(buf);
        let Some(start) = text.find('+') else {
            return (DecodeOutcome::None, buf.len());
        };
        let Some(end_rel) = text[start..].find('$') else {
            if buf.len() > 2048 {
                return (DecodeOutcome::None, buf.len());
            }
            return (DecodeOutcome::None, 0);
        };
        let end = start + end_rel;
        let consumed = end + 1;
        let message = &text[start..=end];

        let Some(colon) = message.find(':') else {
            return (DecodeOutcome::None, consumed);
        };
        let _prefix = &message[1..colon];
        let after_colon = &message[colon + 1..];
        let Some(comma) = after_colon.find(',') else {
            return (DecodeOutcome::None, consumed);
        };
        let msg_type = &after_colon[..comma];
        let payload = &after_colon[comma + 1..after_colon.len() - 1]; // drop trailing '$'
        let fields: Vec<&str> = payload.split(',').collect();

        match msg_type {
            "GTFRI" | "GTGEO" | "GTRTL" | "GTDOG" | "GTIDN" | "GTSOS" | "GTSPD" | "GTPNA" | "GTPFA"
            | "GTIGN" | "GTIGF" => {
                let Some(mut position) = self.parse_position(&fields, msg_type, known_imei) else {
                    return (DecodeOutcome::None, consumed);
                };
                match msg_type {
                    "GTIGN" => {
                        position.ignition = Some(true);
                        position.sensors.insert("event".to_string(), SensorValue::Text("ignition_on".to_string()));
                    }
                    "GTIGF" => {
                        position.ignition = Some(false);
                        position.sensors.insert("event".to_string(), SensorValue::Text("ignition_off".to_string()));
                    }
                    "GTSOS" => {
                        position.sensors.insert("alert_type".to_string(), SensorValue::Text("SOS".to_string()));
                    }
                    "GTSPD" => {
                        position.sensors.insert("alert_type".to_string(), SensorValue::Text("speed".to_string()));
                    }
                    "GTPNA" => {
                        position.sensors.insert("event".to_string(), SensorValue::Text("power_on".to_string()));
                    }
                    "GTPFA" => {
                        position.sensors.insert("event".to_string(), SensorValue::Text("power_off".to_string()));
                    }
                    _ => {}
                }
                (DecodeOutcome::Position(position), consumed)
            }
            _ => (DecodeOutcome::None, consumed),
        }
    }

    fn encode_command(&self, command: &str, params: &CommandParams) -> Vec<u8> {
        let password = match params.get("password") {
            Some(SensorValue::Text(s)) => s.clone(),
            _ => "000000".to_string(),
        };
        let command_str = match command {
            "reboot" => format!("AT+GTRTO={password},,,,0002$"),
            "get_version" => format!("AT+GTVER={password},,0003$"),
            "set_interval" => {
                let interval = params.get("interval").and_then(SensorValue::as_f64).unwrap_or(30.0) as i64;
                format!("AT+GTFRI={password},{interval},,,,0004$")
            }
            "request_position" => format!("AT+GTQSS={password},,0005$"),
            "set_server" => {
                let ip = match params.get("ip") {
                    Some(SensorValue::Text(s)) => s.clone(),
                    _ => String::new(),
                };
                let port = params.get("port").and_then(SensorValue::as_f64).unwrap_or(5026.0) as i64;
                format!("AT+GTBSI={password},{ip},{port},0,0,,,0006$")
            }
            "set_apn" => {
                let apn = match params.get("apn") {
                    Some(SensorValue::Text(s)) => s.clone(),
                    _ => "internet".to_string(),
                };
                format!("AT+GTBSI={password},,,,0,{apn},,,0007$")
            }
            "enable_output" => {
                let output_type = match params.get("output_type") {
                    Some(SensorValue::Text(s)) => s.clone(),
                    _ => "GTFRI".to_string(),
                };
                format!("AT+GTTOW={password},{output_type},1,,0008$")
            }
            "disable_output" => {
                let output_type = match params.get("output_type") {
                    Some(SensorValue::Text(s)) => s.clone(),
                    _ => "GTFRI".to_string(),
                };
                format!("AT+GTTOW={password},{output_type},0,,0009$")
            }
            "custom" => {
                let mut payload = match params.get("payload") {
                    Some(SensorValue::Text(s)) => s.clone(),
                    _ => return Vec::new(),
                };
                if !payload.starts_with("AT+") {
                    payload = format!("AT+{payload}");
                }
                if !payload.ends_with('$') {
                    payload.push('$');
                }
                payload
            }
            _ => return Vec::new(),
        };
        command_str.into_bytes()
    }

    fn available_commands(&self) -> &'static [&'static str] {
        &[
            "reboot",
            "get_version",
            "set_interval",
            "request_position",
            "set_server",
            "set_apn",
            "enable_output",
            "disable_output",
            "custom",
        ]
    }

    fn command_info(&self, name: &str) -> Option<CommandInfo> {
        let (description, params): (&str, Vec<(&str, &str)>) = match name {
            "reboot" => ("Reboot the device", vec![("password", "str")]),
            "get_version" => ("Get firmware version", vec![("password", "str")]),
            "set_interval" => ("Set reporting interval in seconds", vec![("interval", "int"), ("password", "str")]),
            "request_position" => ("Request immediate GPS position", vec![("password", "str")]),
            "set_server" => ("Configure server IP and port", vec![("ip", "str"), ("port", "int"), ("password", "str")]),
            "set_apn" => ("Configure APN for GPRS", vec![("apn", "str"), ("password", "str")]),
            "enable_output" => ("Enable message output type", vec![("output_type", "str"), ("password", "str")]),
            "disable_output" => ("Disable message output type", vec![("output_type", "str"), ("password", "str")]),
            "custom" => ("Send custom AT command", vec![("payload", "str")]),
            _ => return None,
        };
        Some(CommandInfo {
            description: description.to_string(),
            params: params.into_iter().map(|(n, t)| (n.to_string(), t.to_string())).collect(),
        })
    }

    fn max_buffer_size(&self) -> usize {
        2048
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientInfo {
        ClientInfo { ip: "127.0.0.1".to_string(), port: 5026 }
    }

    fn gtfri_message() -> String {
        // version, imei, name, state, reportid, reporttype, number, hdop, speed, course, altitude, lon, lat, timestamp, mcc, mnc, lac, cell
        "+RESP:GTFRI,1,123456789012345,device,1,,0,1.0,45.0,90.0,120.0,121.234567,31.234567,20240101120000,460,0,1,1,,,0001$".to_string()
    }

    #[test]
    fn position_message_parses_lat_lon_and_ignition() {
        let decoder = QueclinkDecoder;
        let msg = gtfri_message();
        let (outcome, consumed) = decoder.decode(msg.as_bytes(), &client(), None);
        assert_eq!(consumed, msg.len());
        match outcome {
            DecodeOutcome::Position(position) => {
                assert_eq!(position.imei, "123456789012345");
                assert!((position.latitude - 31.234567).abs() < 1e-6);
                assert_eq!(position.ignition, Some(true));
            }
            other => panic!("expected position, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_message_without_dollar_waits() {
        let decoder = QueclinkDecoder;
        let msg = b"+RESP:GTFRI,1,12345";
        let (outcome, consumed) = decoder.decode(msg, &client(), None);
        assert_eq!(consumed, 0);
        assert_eq!(outcome, DecodeOutcome::None);
    }
}
