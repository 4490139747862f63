//! Meitrack ASCII protocol decoder (`$$<len>,<imei>,<event>,<payload>*<crc>\r\n`).

use std::collections::HashMap;

use chrono::{TimeZone, Utc};

use crate::checksum::xor_checksum;
use crate::position::{
    ClientInfo, CommandInfo, CommandParams, ControlEvent, DecodeOutcome, NormalizedPosition,
    SensorValue, Transport,
};
use crate::protocol::ProtocolDecoder;

pub struct MeitrackDecoder;

impl MeitrackDecoder {
    fn parse_position(&self, imei: &str, event_code: &str, fields: &[&str]) -> Option<NormalizedPosition> {
        if fields.len() < 10 {
            return None;
        }
        let f_f64 = |idx: usize| -> f64 { fields.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0.0) };
        let f_i64 = |idx: usize| -> i64 { fields.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        let latitude = f_f64(1);
        let longitude = f_f64(2);

        let time_str = fields.get(3).copied().unwrap_or("");
        let device_time = if time_str.len() >= 12 {
            let year = 2000 + time_str[0..2].parse::<i32>().unwrap_or(0);
            let month = time_str[2..4].parse().unwrap_or(1);
            let day = time_str[4..6].parse().unwrap_or(1);
            let hour = time_str[6..8].parse().unwrap_or(0);
            let minute = time_str[8..10].parse().unwrap_or(0);
            let second = time_str[10..12].parse().unwrap_or(0);
            Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
                .single()
                .unwrap_or_else(Utc::now)
        } else {
            Utc::now()
        };

        let valid = fields.get(4).copied() == Some("A");
        let satellites = f_i64(5) as u8;
        let gsm_signal = f_i64(6);
        let speed = f_f64(7);
        let course = f_f64(8);
        let hdop = f_f64(9);
        let altitude = f_f64(10);

        let mut sensors: HashMap<String, SensorValue> = HashMap::from([
            ("event_code".to_string(), SensorValue::Text(event_code.to_string())),
            ("gsm_signal".to_string(), SensorValue::Int(gsm_signal)),
        ]);

        if let Some(v) = fields.get(11).filter(|s| !s.is_empty()) {
            if let Ok(odo) = v.parse::<f64>() {
                sensors.insert("odometer".to_string(), SensorValue::Float(odo));
            }
        }
        if let Some(v) = fields.get(12).filter(|s| !s.is_empty()) {
            if let Ok(rt) = v.parse::<i64>() {
                sensors.insert("runtime".to_string(), SensorValue::Int(rt));
            }
        }
        if let Some(v) = fields.get(13).filter(|s| !s.is_empty()) {
            let bs: Vec<&str> = v.split('|').collect();
            if bs.len() >= 4 {
                sensors.insert("mcc".to_string(), SensorValue::Text(bs[0].to_string()));
                sensors.insert("mnc".to_string(), SensorValue::Text(bs[1].to_string()));
                sensors.insert("lac".to_string(), SensorValue::Text(bs[2].to_string()));
                sensors.insert("cell_id".to_string(), SensorValue::Text(bs[3].to_string()));
            }
        }
        if let Some(v) = fields.get(14).filter(|s| !s.is_empty()) {
            if let Ok(bv) = v.parse::<f64>() {
                sensors.insert("battery_voltage".to_string(), SensorValue::Float(bv));
            }
        }
        if let Some(v) = fields.get(15).filter(|s| !s.is_empty()) {
            if let Ok(bp) = v.parse::<i64>() {
                sensors.insert("battery_percent".to_string(), SensorValue::Int(bp));
            }
        }

        let mut ignition = None;
        if let Some(v) = fields.get(16).filter(|s| !s.is_empty()) {
            if let Ok(digital_inputs) = v.parse::<i64>() {
                sensors.insert("digital_inputs".to_string(), SensorValue::Int(digital_inputs));
                ignition = Some(digital_inputs & 0x01 != 0);
            }
        }
        if let Some(v) = fields.get(17).filter(|s| !s.is_empty()) {
            if let Ok(out) = v.parse::<i64>() {
                sensors.insert("digital_outputs".to_string(), SensorValue::Int(out));
            }
        }
        if let Some(v) = fields.get(18).filter(|s| !s.is_empty()) {
            for (i, val) in v.split('|').enumerate() {
                if !val.is_empty() {
                    if let Ok(f) = val.parse::<f64>() {
                        sensors.insert(format!("analog_{}", i + 1), SensorValue::Float(f));
                    }
                }
            }
        }

        Some(
            NormalizedPosition {
                imei: imei.to_string(),
                device_time,
                server_time: Utc::now(),
                latitude,
                longitude,
                altitude: Some(altitude),
                speed: Some(speed),
                course: Some(course),
                satellites: Some(satellites),
                hdop: Some(hdop),
                ignition,
                sensors,
                valid_fix: valid,
                raw_data: None,
            }
            .sanitize(),
        )
    }
}

impl ProtocolDecoder for MeitrackDecoder {
    fn name(&self) -> &'static str {
        "meitrack"
    }

    fn port(&self) -> u16 {
        5020
    }

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn decode(
        &self,
        buf: &[u8],
        _client: &ClientInfo,
        _known_imei: Option<&str>,
    ) -> (DecodeOutcome, usize) {
        if buf.is_empty() {
            return (DecodeOutcome::None, 0);
        }
        let text = String::from_utf8_lossy(buf);
        let Some(start) = text.find("$$") else {
            return (DecodeOutcome::None, buf.len());
        };
        let Some(newline_rel) = text[start..].find('\n') else {
            if buf.len() > 2048 {
                return (DecodeOutcome::None, buf.len());
            }
            return (DecodeOutcome::None, 0);
        };
        let end = start + newline_rel;
        let consumed = end + 1;
        let message = text[start..consumed].trim_end_matches(['\r', '\n']);
        let body = &message[2..]; // drop "$$"

        let mut parts = body.splitn(4, ',');
        let Some(_len_field) = parts.next() else {
            return (DecodeOutcome::None, consumed);
        };
        let Some(imei) = parts.next() else {
            return (DecodeOutcome::None, consumed);
        };
        let Some(event_code) = parts.next() else {
            return (DecodeOutcome::None, consumed);
        };
        let Some(rest) = parts.next() else {
            return (DecodeOutcome::None, consumed);
        };
        let payload = match rest.rfind('*') {
            Some(star) => &rest[..star],
            None => rest,
        };
        let fields: Vec<&str> = payload.split(',').collect();

        match event_code {
            "AAA" | "CCC" | "DDD" => match self.parse_position(imei, event_code, &fields) {
                Some(position) => {
                    if event_code == "AAA" {
                        let response = format!("$$B{},{},AAA\r\n", imei.len() + 3, imei);
                        (
                            DecodeOutcome::Control(ControlEvent {
                                event: "login".to_string(),
                                imei: Some(imei.to_string()),
                                response_bytes: Some(response.into_bytes()),
                                position: Some(position),
                                ..Default::default()
                            }),
                            consumed,
                        )
                    } else {
                        (DecodeOutcome::Position(position), consumed)
                    }
                }
                None => (DecodeOutcome::None, consumed),
            },
            _ => (DecodeOutcome::None, consumed),
        }
    }

    fn encode_command(&self, command: &str, params: &CommandParams) -> Vec<u8> {
        let imei = match params.get("imei") {
            Some(SensorValue::Text(s)) => s.clone(),
            _ => return Vec::new(),
        };
        let cmd_str = match command {
            "request_position" => format!("A10,{imei}"),
            "reboot" => format!("A11,{imei}"),
            "set_interval" => {
                let interval = params.get("interval").and_then(SensorValue::as_f64).unwrap_or(30.0) as i64;
                format!("A12,{imei},{interval}")
            }
            "set_server" => {
                let ip = match params.get("ip") {
                    Some(SensorValue::Text(s)) => s.clone(),
                    _ => String::new(),
                };
                let port = params.get("port").and_then(SensorValue::as_f64).unwrap_or(5020.0) as i64;
                format!("A13,{imei},{ip},{port}")
            }
            "set_apn" => {
                let apn = match params.get("apn") {
                    Some(SensorValue::Text(s)) => s.clone(),
                    _ => "internet".to_string(),
                };
                format!("A14,{imei},{apn},,")
            }
            "enable_output" => {
                let output_type = match params.get("output_type") {
                    Some(SensorValue::Text(s)) => s.clone(),
                    _ => "ACC".to_string(),
                };
                format!("A16,{imei},{output_type},1")
            }
            "disable_output" => {
                let output_type = match params.get("output_type") {
                    Some(SensorValue::Text(s)) => s.clone(),
                    _ => "ACC".to_string(),
                };
                format!("A16,{imei},{output_type},0")
            }
            "custom" => match params.get("payload") {
                Some(SensorValue::Text(s)) => s.clone(),
                _ => return Vec::new(),
            },
            _ => return Vec::new(),
        };
        let command_str = format!("@@A{:02},{}", cmd_str.len(), cmd_str);
        let checksum = xor_checksum(command_str.as_bytes());
        format!("{command_str}*{checksum:02X}\r\n").into_bytes()
    }

    fn available_commands(&self) -> &'static [&'static str] {
        &[
            "request_position",
            "reboot",
            "set_interval",
            "set_server",
            "set_apn",
            "enable_output",
            "disable_output",
            "custom",
        ]
    }

    fn command_info(&self, name: &str) -> Option<CommandInfo> {
        let (description, params): (&str, Vec<(&str, &str)>) = match name {
            "request_position" => ("Request current position", vec![("imei", "str")]),
            "reboot" => ("Reboot the device", vec![("imei", "str")]),
            "set_interval" => ("Set reporting interval in seconds", vec![("imei", "str"), ("interval", "int")]),
            "set_server" => ("Set server IP and port", vec![("imei", "str"), ("ip", "str"), ("port", "int")]),
            "set_apn" => ("Set GPRS APN", vec![("imei", "str"), ("apn", "str")]),
            "enable_output" => ("Enable output (ACC, etc.)", vec![("imei", "str"), ("output_type", "str")]),
            "disable_output" => ("Disable output (ACC, etc.)", vec![("imei", "str"), ("output_type", "str")]),
            "custom" => ("Send a raw custom command string", vec![("imei", "str"), ("payload", "str")]),
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
        ClientInfo { ip: "127.0.0.1".to_string(), port: 5020 }
    }

    #[test]
    fn login_event_returns_ack_and_position() {
        let decoder = MeitrackDecoder;
        let msg = "$$A123,123456789012345,AAA,1,31.234567,121.234567,240101120000,A,10,12,40,90,1.2,100,200,300,3|4|5|6|12.34,80,1,0,|*AB\r\n";
        let (outcome, consumed) = decoder.decode(msg.as_bytes(), &client(), None);
        assert_eq!(consumed, msg.len());
        match outcome {
            DecodeOutcome::Control(ev) => {
                assert_eq!(ev.event, "login");
                assert!(ev.position.is_some());
            }
            other => panic!("expected login control event, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_frame_without_newline_waits() {
        let decoder = MeitrackDecoder;
        let msg = b"$$A123,123456789012345,AAA,31.23";
        let (outcome, consumed) = decoder.decode(msg, &client(), None);
        assert_eq!(consumed, 0);
        assert_eq!(outcome, DecodeOutcome::None);
    }
}
