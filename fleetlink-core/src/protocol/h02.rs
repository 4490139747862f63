//! H02 ASCII protocol decoder (`*HQ,<imei>,<type>,...#`), TCP port 5013.
//!
//! Messages are `#`-terminated but the stream gives no other guarantee
//! about where reads split, so `decode` looks for the next `#` in the
//! buffer and reports zero bytes consumed until one shows up.

use chrono::{TimeZone, Utc};

use crate::position::{
    ClientInfo, CommandInfo, CommandParams, ControlEvent, DecodeOutcome, NormalizedPosition,
    Transport,
};
use crate::protocol::ProtocolDecoder;

pub struct H02Decoder;

/// Parses an NMEA-style `DDDMM.MMMM` (or `DDMM.MMMM`) coordinate field,
/// where the last two digits before the decimal point are minutes.
fn parse_coordinate(value: &str, hemisphere: &str) -> Option<f64> {
    if value.is_empty() {
        return None;
    }
    let dot = value.find('.');
    let (degrees, minutes) = match dot {
        None => {
            let (d, m) = value.split_at(value.len().checked_sub(2)?);
            (d.parse::<f64>().ok()?, m.parse::<f64>().ok()?)
        }
        Some(dot_idx) => {
            let split = dot_idx.checked_sub(2)?;
            let (d, m) = value.split_at(split);
            (d.parse::<f64>().ok()?, m.parse::<f64>().ok()?)
        }
    };
    let value = degrees + minutes / 60.0;
    Some(if hemisphere == "S" || hemisphere == "W" { -value } else { value })
}

impl H02Decoder {
    fn decode_position(&self, parts: &[&str]) -> Option<NormalizedPosition> {
        let imei = parts[0];
        if parts[3] != "A" {
            return None;
        }
        let lat = parse_coordinate(parts[4], parts[5])?;
        let lon = parse_coordinate(parts[6], parts[7])?;
        let speed: f64 = parts[8].parse().ok()?;
        let speed = speed * 1.852;
        let course: f64 = parts[9].parse().ok()?;

        let time_str = parts[2];
        let date_str = parts[10];
        if time_str.len() < 6 || date_str.len() < 6 {
            return None;
        }
        let hour: u32 = time_str[0..2].parse().ok()?;
        let minute: u32 = time_str[2..4].parse().ok()?;
        let second: u32 = time_str[4..6].parse().ok()?;
        let day: u32 = date_str[0..2].parse().ok()?;
        let month: u32 = date_str[2..4].parse().ok()?;
        let year: i32 = 2000 + date_str[4..6].parse::<i32>().ok()?;
        let device_time = Utc
            .with_ymd_and_hms(year, month, day, hour, minute, second)
            .single()
            .unwrap_or_else(Utc::now);

        Some(
            NormalizedPosition {
                imei: imei.to_string(),
                device_time,
                server_time: Utc::now(),
                latitude: lat,
                longitude: lon,
                altitude: None,
                speed: Some(speed),
                course: Some(course),
                satellites: None,
                hdop: None,
                ignition: None,
                sensors: Default::default(),
                valid_fix: true,
                raw_data: None,
            }
            .sanitize(),
        )
    }
}

impl ProtocolDecoder for H02Decoder {
    fn name(&self) -> &'static str {
        "h02"
    }

    fn port(&self) -> u16 {
        5013
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
        let Some(end) = buf.iter().position(|&b| b == b'#') else {
            return (DecodeOutcome::None, 0);
        };
        let consumed = end + 1;
        let Ok(text) = std::str::from_utf8(&buf[..consumed]) else {
            return (DecodeOutcome::None, consumed);
        };
        let text = text.trim().trim_end_matches('#');
        let Some(rest) = text.strip_prefix("*HQ,") else {
            return (DecodeOutcome::None, consumed);
        };
        let parts: Vec<&str> = rest.split(',').collect();
        if parts.len() < 12 {
            return (DecodeOutcome::None, consumed);
        }

        let msg_type = parts[1];
        match msg_type {
            "V1" | "V4" => match self.decode_position(&parts) {
                Some(position) => (DecodeOutcome::Position(position), consumed),
                None => (DecodeOutcome::None, consumed),
            },
            "NBR" | "HTBT" | "LINK" => {
                let imei = parts[0].to_string();
                // Devices drop the connection if a heartbeat goes unanswered.
                let response_bytes = (msg_type == "HTBT")
                    .then(|| format!("*HQ,{imei},R12#").into_bytes());
                (
                    DecodeOutcome::Control(ControlEvent {
                        event: msg_type.to_lowercase(),
                        imei: Some(imei),
                        response_bytes,
                        ..Default::default()
                    }),
                    consumed,
                )
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
        1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientInfo {
        ClientInfo { ip: "127.0.0.1".to_string(), port: 5013 }
    }

    #[test]
    fn position_message_decodes() {
        let decoder = H02Decoder;
        let msg = "*HQ,123456789012345,V1,120000,A,1234.5678,N,12345.6789,E,000.0,123,010124,0000,0000#";
        let (outcome, consumed) = decoder.decode(msg.as_bytes(), &client(), None);
        assert_eq!(consumed, msg.len());
        match outcome {
            DecodeOutcome::Position(position) => {
                assert_eq!(position.imei, "123456789012345");
                assert!(position.latitude > 0.0);
            }
            other => panic!("expected position, got {other:?}"),
        }
    }

    #[test]
    fn message_with_no_terminator_waits_for_more_data() {
        let decoder = H02Decoder;
        let (outcome, consumed) = decoder.decode(b"*HQ,123,V1,partial", &client(), None);
        assert_eq!(consumed, 0);
        assert_eq!(outcome, DecodeOutcome::None);
    }

    #[test]
    fn unparseable_message_is_consumed_once_terminated() {
        let decoder = H02Decoder;
        let (outcome, consumed) = decoder.decode(b"garbage#", &client(), None);
        assert_eq!(consumed, 8);
        assert_eq!(outcome, DecodeOutcome::None);
    }

    #[test]
    fn heartbeat_is_acked_with_r12() {
        let decoder = H02Decoder;
        let msg = "*HQ,123456789012345,HTBT,120000,0,0,0,0,0,0,0,0,0#";
        let (outcome, consumed) = decoder.decode(msg.as_bytes(), &client(), None);
        assert_eq!(consumed, msg.len());
        match outcome {
            DecodeOutcome::Control(ev) => {
                assert_eq!(ev.event, "htbt");
                assert_eq!(
                    ev.response_bytes,
                    Some(b"*HQ,123456789012345,R12#".to_vec())
                );
            }
            other => panic!("expected control event, got {other:?}"),
        }
    }
}
