//! OsmAnd HTTP GET tracking protocol decoder.
//!
//! Each connection carries exactly one HTTP request: `GET /?lat=..&lon=..
//! HTTP/1.1`, terminated by the blank line ending the header block.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::position::{
    ClientInfo, CommandInfo, CommandParams, ControlEvent, DecodeOutcome, NormalizedPosition,
    SensorValue, Transport,
};
use crate::protocol::ProtocolDecoder;

pub struct OsmAndDecoder;

fn parse_query_params(url_path: &str) -> HashMap<String, String> {
    let Some((_, query)) = url_path.split_once('?') else {
        return HashMap::new();
    };
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| -> String {
                percent_decode(s).replace('+', " ")
            };
            Some((decode(key), decode(value)))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn unix_time_to_datetime(timestamp: i64) -> DateTime<Utc> {
    if timestamp > 10_000_000_000 {
        Utc.timestamp_millis_opt(timestamp).single()
    } else {
        Utc.timestamp_opt(timestamp, 0).single()
    }
    .unwrap_or_else(Utc::now)
}

impl OsmAndDecoder {
    fn parse_params(&self, params: &HashMap<String, String>, device_id: &str) -> Option<NormalizedPosition> {
        let latitude: f64 = params
            .get("lat")
            .or_else(|| params.get("latitude"))?
            .parse()
            .ok()?;
        let longitude: f64 = params
            .get("lon")
            .or_else(|| params.get("longitude"))?
            .parse()
            .ok()?;

        let device_time = params
            .get("timestamp")
            .and_then(|s| s.parse::<f64>().ok())
            .map(|t| unix_time_to_datetime(t as i64))
            .unwrap_or_else(Utc::now);

        let speed_ms: f64 = params.get("speed").and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let speed_kmh = speed_ms * 3.6;
        let course: f64 = params
            .get("bearing")
            .or_else(|| params.get("course"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let altitude: f64 = params
            .get("altitude")
            .or_else(|| params.get("alt"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let satellites: u8 = params
            .get("sat")
            .and_then(|s| s.parse::<f64>().ok())
            .map(|v| v as u8)
            .unwrap_or(0);

        let mut sensors = HashMap::new();
        if let Some(v) = params.get("hdop").and_then(|s| s.parse::<f64>().ok()) {
            sensors.insert("hdop".to_string(), SensorValue::Float(v));
        }
        if let Some(v) = params.get("accuracy").and_then(|s| s.parse::<f64>().ok()) {
            sensors.insert("accuracy".to_string(), SensorValue::Float(v));
        }
        if let Some(v) = params
            .get("batt")
            .or_else(|| params.get("battery"))
            .and_then(|s| s.parse::<f64>().ok())
        {
            sensors.insert("battery".to_string(), SensorValue::Float(v));
        }
        const KNOWN: &[&str] = &[
            "id", "deviceid", "lat", "latitude", "lon", "longitude", "speed", "bearing", "course",
            "altitude", "alt", "timestamp", "sat", "hdop", "accuracy", "batt", "battery",
        ];
        for (key, value) in params {
            if !KNOWN.contains(&key.as_str()) {
                sensors.insert(key.clone(), SensorValue::Text(value.clone()));
            }
        }

        Some(
            NormalizedPosition {
                imei: device_id.to_string(),
                device_time,
                server_time: Utc::now(),
                latitude,
                longitude,
                altitude: Some(altitude),
                speed: Some(speed_kmh),
                course: Some(course),
                satellites: Some(satellites),
                hdop: sensors.get("hdop").and_then(SensorValue::as_f64),
                ignition: None,
                sensors,
                valid_fix: true,
                raw_data: None,
            }
            .sanitize(),
        )
    }
}

impl ProtocolDecoder for OsmAndDecoder {
    fn name(&self) -> &'static str {
        "osmand"
    }

    fn port(&self) -> u16 {
        5055
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

        let end = text.find("\r\n\r\n").map(|i| i + 4).or_else(|| text.find("\n\n").map(|i| i + 2));
        let Some(end) = end else {
            if buf.len() > 4096 {
                return (DecodeOutcome::None, buf.len());
            }
            return (DecodeOutcome::None, 0);
        };
        let request_text = &text[..end];
        let consumed = request_text.len();

        let Some(first_line) = request_text.split('\n').next() else {
            return (DecodeOutcome::None, consumed);
        };
        let first_line = first_line.trim();
        if !first_line.starts_with("GET ") {
            return (DecodeOutcome::None, consumed);
        }
        let parts: Vec<&str> = first_line.split(' ').collect();
        if parts.len() < 2 {
            return (DecodeOutcome::None, consumed);
        }
        let url_path = parts[1];
        let params = parse_query_params(url_path);
        if params.is_empty() {
            return (DecodeOutcome::None, consumed);
        }

        let device_id = known_imei.map(str::to_string).or_else(|| {
            params.get("id").or_else(|| params.get("deviceid")).cloned()
        });
        let Some(device_id) = device_id else {
            return (DecodeOutcome::None, consumed);
        };

        match self.parse_params(&params, &device_id) {
            Some(position) => (
                DecodeOutcome::Control(ControlEvent {
                    event: "position".to_string(),
                    imei: Some(device_id),
                    response_bytes: Some(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()),
                    position: Some(position),
                    ..Default::default()
                }),
                consumed,
            ),
            None => (DecodeOutcome::None, consumed),
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
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientInfo {
        ClientInfo { ip: "127.0.0.1".to_string(), port: 5055 }
    }

    #[test]
    fn get_request_parses_position_and_converts_speed() {
        let decoder = OsmAndDecoder;
        let req = "GET /?id=123456&lat=37.7749&lon=-122.4194&speed=10&bearing=180&altitude=15 HTTP/1.1\r\nHost: x\r\n\r\n";
        let (outcome, consumed) = decoder.decode(req.as_bytes(), &client(), None);
        assert_eq!(consumed, req.len());
        match outcome {
            DecodeOutcome::Control(ev) => {
                let position = ev.position.unwrap();
                assert_eq!(position.imei, "123456");
                assert_eq!(position.speed, Some(36.0));
            }
            other => panic!("expected control event with position, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_headers_wait_for_blank_line() {
        let decoder = OsmAndDecoder;
        let req = b"GET /?id=1&lat=1&lon=1 HTTP/1.1\r\nHost: x\r\n";
        let (outcome, consumed) = decoder.decode(req, &client(), None);
        assert_eq!(consumed, 0);
        assert_eq!(outcome, DecodeOutcome::None);
    }
}
