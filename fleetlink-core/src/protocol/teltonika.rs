//! Teltonika Codec 8 / Codec 8 Extended / Codec 12 (GPRS commands) decoder.
//!
//! Two distinct framings share this listener: a plaintext login frame
//! (`u16` IMEI length followed by the ASCII IMEI) sent once at connection
//! start, and the binary AVL data frame (zero preamble, `u32` data length,
//! codec id, one or more records, trailing CRC-16/IBM) sent for every
//! subsequent batch of fixes.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::checksum::crc16_ibm;
use crate::position::{
    ClientInfo, CommandInfo, CommandParams, ControlEvent, DecodeOutcome, NormalizedPosition,
    SensorValue, Transport,
};
use crate::protocol::ProtocolDecoder;

const CODEC8: u8 = 0x08;
const CODEC8_EXT: u8 = 0x8E;
const CODEC12: u8 = 0x0C;

/// IO element id -> sensor name, ported from the element table Teltonika
/// documents for the FMB/FMC series.
fn io_name(id: u16) -> String {
    let name = match id {
        1 => "din1",
        2 => "din2",
        3 => "din3",
        4 => "din4",
        9 => "adc1",
        10 => "adc2",
        11 => "iccid",
        12 => "fuel_used",
        13 => "fuel_consumption",
        16 => "odometer",
        17 => "axisX",
        18 => "axisY",
        19 => "axisZ",
        21 => "gsm_signal",
        24 => "speed",
        30 => "fault_count",
        31 => "engine_load",
        32 => "coolant_temp",
        36 => "rpm",
        66 => "external_voltage",
        67 => "battery_voltage",
        68 => "battery_current",
        69 => "gnss_status",
        70 => "pcb_temp",
        72 => "temp1",
        73 => "temp2",
        74 => "temp3",
        75 => "temp4",
        80 => "data_mode",
        81 => "obd_speed",
        82 => "throttle",
        83 => "fuel_used_obd",
        84 => "fuel_level_obd",
        85 => "rpm_obd",
        87 => "odometer_obd",
        89 => "fuel_level_percent",
        113 => "battery_level_percent",
        115 => "engine_temp",
        179 => "din_out1",
        180 => "din_out2",
        181 => "pdop",
        182 => "hdop",
        199 => "trip_odometer",
        200 => "sleep_mode",
        205 => "cid2g",
        206 => "lac",
        239 => "ignition",
        240 => "movement",
        241 => "gsm_operator",
        244 => "roaming",
        636 => "cid4g",
        662 => "door",
        other => return format!("io_{other}"),
    };
    name.to_string()
}

/// IO elements whose raw integer value is scaled before being reported.
fn io_multiplier(id: u16) -> Option<f64> {
    match id {
        9 | 10 | 12 => Some(0.001),
        13 => Some(0.01),
        21 => Some(1.0),
        24 => Some(1.852),
        25..=28 => Some(0.01),
        66 | 67 | 68 => Some(0.001),
        70 | 72..=75 | 83 | 84 => Some(0.1),
        110 => Some(0.1),
        115 | 181 | 182 => Some(0.1),
        701..=704 => Some(0.01),
        _ => None,
    }
}

pub struct TeltonikaDecoder;

impl TeltonikaDecoder {
    fn decode_login(&self, buf: &[u8]) -> (DecodeOutcome, usize) {
        if buf.len() < 2 {
            return (DecodeOutcome::None, 0);
        }
        let imei_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if imei_len == 0 {
            // Not a login frame after all; let the data-frame path resync.
            return (DecodeOutcome::None, 0);
        }
        if buf.len() < 2 + imei_len {
            return (DecodeOutcome::None, 0);
        }
        match std::str::from_utf8(&buf[2..2 + imei_len]) {
            Ok(imei) => (
                DecodeOutcome::Control(ControlEvent {
                    event: "login".to_string(),
                    imei: Some(imei.to_string()),
                    response_bytes: Some(vec![0x01]),
                    ..Default::default()
                }),
                2 + imei_len,
            ),
            Err(_) => (DecodeOutcome::None, 1),
        }
    }

    fn decode_data_frame(&self, buf: &[u8], known_imei: Option<&str>) -> (DecodeOutcome, usize) {
        if buf.len() < 8 {
            return (DecodeOutcome::None, 0);
        }
        let data_length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let total_len = 8 + data_length + 4;
        if buf.len() < total_len {
            return (DecodeOutcome::None, 0);
        }
        let packet = &buf[8..8 + data_length];
        let crc_field = u32::from_be_bytes([
            buf[8 + data_length],
            buf[9 + data_length],
            buf[10 + data_length],
            buf[11 + data_length],
        ]);
        let expected_crc = crc16_ibm(packet) as u32;
        if expected_crc != crc_field {
            return (DecodeOutcome::None, total_len);
        }
        if packet.len() < 2 {
            return (DecodeOutcome::None, total_len);
        }
        let Some(imei) = known_imei else {
            return (DecodeOutcome::None, total_len);
        };
        let codec_id = packet[0];
        let outcome = match codec_id {
            CODEC8 => self.decode_codec8(&packet[1..], imei, false),
            CODEC8_EXT => self.decode_codec8(&packet[1..], imei, true),
            CODEC12 => self.decode_codec12_response(&packet[1..]),
            _ => None,
        };
        match outcome {
            Some(control) => (DecodeOutcome::Control(control), total_len),
            None => (DecodeOutcome::None, total_len),
        }
    }

    fn decode_codec8(&self, data: &[u8], imei: &str, extended: bool) -> Option<ControlEvent> {
        if data.is_empty() {
            return None;
        }
        let num_records = data[0] as usize;
        let mut offset = 1;
        let mut positions = Vec::with_capacity(num_records);
        for _ in 0..num_records {
            let (position, consumed) = self.decode_one_record(&data[offset..], imei, extended)?;
            if let Some(position) = position {
                positions.push(position);
            }
            offset += consumed;
        }
        // The device expects its ACK to echo the number of records it sent,
        // not the number that survived the lat=0/lon=0 filter below.
        let response_bytes = Some((num_records as u32).to_be_bytes().to_vec());
        let mut positions = positions.into_iter();
        let first = positions.next();
        Some(ControlEvent {
            event: "position".to_string(),
            imei: Some(imei.to_string()),
            position: first,
            extra_positions: positions.collect(),
            response_bytes,
            ..Default::default()
        })
    }

    /// Returns `Some((None, consumed))` for a structurally valid record at
    /// `lat == 0.0 && lon == 0.0` (a device with no fix yet) — discarded but
    /// still consumed so the next record in the frame stays in sync.
    fn decode_one_record(
        &self,
        data: &[u8],
        imei: &str,
        extended: bool,
    ) -> Option<(Option<NormalizedPosition>, usize)> {
        if data.len() < 24 {
            return None;
        }
        let timestamp_ms = u64::from_be_bytes(data[0..8].try_into().ok()?);
        let device_time = ms_to_datetime(timestamp_ms);
        let priority = data[8];
        let lon = i32::from_be_bytes(data[9..13].try_into().ok()?) as f64 / 10_000_000.0;
        let lat = i32::from_be_bytes(data[13..17].try_into().ok()?) as f64 / 10_000_000.0;
        let altitude = i16::from_be_bytes(data[17..19].try_into().ok()?) as f64;
        let angle = u16::from_be_bytes(data[19..21].try_into().ok()?) as f64;
        let satellites = data[21];
        let speed = u16::from_be_bytes(data[22..24].try_into().ok()?) as f64;
        let mut offset = 24;

        let mut ignition = None;
        let mut sensors = HashMap::new();

        offset += 1; // event io id
        let _total_io = self.read_count(data, &mut offset, extended)?;

        for width in [1usize, 2, 4, 8] {
            let count = self.read_count(data, &mut offset, extended)?;
            for _ in 0..count {
                let iw = if extended { 2 } else { 1 };
                if offset + iw > data.len() {
                    return None;
                }
                let io_id = if extended {
                    u16::from_be_bytes([data[offset], data[offset + 1]])
                } else {
                    data[offset] as u16
                };
                offset += if extended { 2 } else { 1 };
                if offset + width > data.len() {
                    return None;
                }
                let raw = &data[offset..offset + width];
                let value: u64 = raw.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
                offset += width;
                if io_id == 239 {
                    ignition = Some(value != 0);
                }
                let scaled = match io_multiplier(io_id) {
                    Some(mult) => SensorValue::Float((value as f64 * mult * 1000.0).round() / 1000.0),
                    None => SensorValue::Int(value as i64),
                };
                sensors.insert(io_name(io_id), scaled);
            }
        }

        sensors.insert("priority".to_string(), SensorValue::Int(priority as i64));

        if lat == 0.0 && lon == 0.0 {
            return Some((None, offset));
        }

        let position = NormalizedPosition {
            imei: imei.to_string(),
            device_time,
            server_time: Utc::now(),
            latitude: lat,
            longitude: lon,
            altitude: Some(altitude),
            speed: Some(speed),
            course: Some(angle),
            satellites: Some(satellites),
            hdop: None,
            ignition,
            sensors,
            valid_fix: satellites > 0,
            raw_data: None,
        }
        .sanitize();

        Some((Some(position), offset))
    }

    /// Reads an element-count byte. Codec 8 Extended uses two bytes here.
    fn read_count(&self, data: &[u8], offset: &mut usize, extended: bool) -> Option<usize> {
        if extended {
            if *offset + 2 > data.len() {
                return None;
            }
            let count = u16::from_be_bytes([data[*offset], data[*offset + 1]]) as usize;
            *offset += 2;
            Some(count)
        } else {
            if *offset + 1 > data.len() {
                return None;
            }
            let count = data[*offset] as usize;
            *offset += 1;
            Some(count)
        }
    }

    fn decode_codec12_response(&self, data: &[u8]) -> Option<ControlEvent> {
        // Type 0x06 = response from device to a GPRS command.
        if data.len() < 5 || data[0] != 0x06 {
            return None;
        }
        let response_len = u32::from_be_bytes(data[1..5].try_into().ok()?) as usize;
        let text = std::str::from_utf8(data.get(5..5 + response_len)?).ok()?;
        Some(ControlEvent {
            event: "command_response".to_string(),
            sensors: HashMap::from([("response".to_string(), SensorValue::Text(text.to_string()))]),
            ..Default::default()
        })
    }
}

fn ms_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

impl ProtocolDecoder for TeltonikaDecoder {
    fn name(&self) -> &'static str {
        "teltonika"
    }

    fn port(&self) -> u16 {
        5027
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
        if buf.len() >= 4 && buf[0..4] == [0, 0, 0, 0] {
            return self.decode_data_frame(buf, known_imei);
        }
        self.decode_login(buf)
    }

    fn encode_command(&self, command: &str, params: &CommandParams) -> Vec<u8> {
        if command != "getver" && command != "custom" {
            return Vec::new();
        }
        let text = match params.get("command") {
            Some(SensorValue::Text(s)) => s.clone(),
            _ => "getver".to_string(),
        };
        let body = text.as_bytes();
        let mut packet = Vec::new();
        packet.extend_from_slice(&[0, 0, 0, 0]); // preamble
        let mut payload = Vec::new();
        payload.push(CODEC12);
        payload.push(0x01); // 1 command
        payload.push(0x05); // type: command
        payload.extend_from_slice(&(body.len() as u32).to_be_bytes());
        payload.extend_from_slice(body);
        payload.push(0x01); // record count repeated
        let data_length = payload.len() as u32;
        packet.extend_from_slice(&data_length.to_be_bytes());
        packet.extend_from_slice(&payload);
        let crc = crc16_ibm(&payload) as u32;
        packet.extend_from_slice(&crc.to_be_bytes());
        packet
    }

    fn available_commands(&self) -> &'static [&'static str] {
        &["getver", "custom"]
    }

    fn command_info(&self, name: &str) -> Option<CommandInfo> {
        match name {
            "getver" => Some(CommandInfo {
                description: "Query firmware version via Codec 12".to_string(),
                params: vec![],
            }),
            "custom" => Some(CommandInfo {
                description: "Send an arbitrary Codec 12 command string".to_string(),
                params: vec![("command".to_string(), "string".to_string())],
            }),
            _ => None,
        }
    }

    fn max_buffer_size(&self) -> usize {
        8192
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientInfo {
        ClientInfo { ip: "127.0.0.1".to_string(), port: 12345 }
    }

    #[test]
    fn login_frame_binds_imei() {
        let decoder = TeltonikaDecoder;
        let imei = "123456789012345";
        let mut buf = vec![0u8, imei.len() as u8];
        buf.extend_from_slice(imei.as_bytes());
        let (outcome, consumed) = decoder.decode(&buf, &client(), None);
        assert_eq!(consumed, 2 + imei.len());
        match outcome {
            DecodeOutcome::Control(ev) => {
                assert_eq!(ev.event, "login");
                assert_eq!(ev.imei.as_deref(), Some(imei));
            }
            other => panic!("expected login control event, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_data_frame_consumes_nothing() {
        let decoder = TeltonikaDecoder;
        let buf = [0u8, 0, 0, 0, 0, 0, 0, 50]; // header claims 50 bytes of payload, none present
        let (outcome, consumed) = decoder.decode(&buf, &client(), Some("123"));
        assert_eq!(consumed, 0);
        assert_eq!(outcome, DecodeOutcome::None);
    }

    #[test]
    fn codec8_single_record_roundtrip() {
        let decoder = TeltonikaDecoder;
        let imei = "123456789012345";

        let mut record = Vec::new();
        record.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        record.push(1); // priority
        record.extend_from_slice(&((12.34_f64 * 10_000_000.0) as i32).to_be_bytes()); // lon
        record.extend_from_slice(&((56.78_f64 * 10_000_000.0) as i32).to_be_bytes()); // lat
        record.extend_from_slice(&100i16.to_be_bytes()); // altitude
        record.extend_from_slice(&90u16.to_be_bytes()); // angle
        record.push(6); // satellites
        record.extend_from_slice(&45u16.to_be_bytes()); // speed
        record.push(0); // event io id
        record.push(0); // n1 total
        record.push(0); // n1 count
        record.push(0); // n2 count
        record.push(0); // n4 count
        record.push(0); // n8 count

        let mut payload = Vec::new();
        payload.push(CODEC8);
        payload.push(1); // record count
        payload.extend_from_slice(&record);
        payload.push(1); // record count repeated

        let mut frame = Vec::new();
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        let crc = crc16_ibm(&payload) as u32;
        frame.extend_from_slice(&crc.to_be_bytes());

        let (outcome, consumed) = decoder.decode(&frame, &client(), Some(imei));
        assert_eq!(consumed, frame.len());
        match outcome {
            DecodeOutcome::Control(ev) => {
                let position = ev.position.expect("expected a position");
                assert_eq!(position.imei, imei);
                assert!((position.latitude - 56.78).abs() < 1e-6);
                assert!((position.longitude - 12.34).abs() < 1e-6);
                assert_eq!(position.speed, Some(45.0));
                assert_eq!(ev.response_bytes, Some(1u32.to_be_bytes().to_vec()));
            }
            other => panic!("expected position control event, got {other:?}"),
        }
    }

    #[test]
    fn zero_coordinate_record_is_discarded_but_still_acked() {
        let decoder = TeltonikaDecoder;
        let imei = "123456789012345";

        let mut record = Vec::new();
        record.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        record.push(1); // priority
        record.extend_from_slice(&0i32.to_be_bytes()); // lon = 0
        record.extend_from_slice(&0i32.to_be_bytes()); // lat = 0
        record.extend_from_slice(&0i16.to_be_bytes()); // altitude
        record.extend_from_slice(&0u16.to_be_bytes()); // angle
        record.push(0); // satellites
        record.extend_from_slice(&0u16.to_be_bytes()); // speed
        record.push(0); // event io id
        record.push(0); // n1 total
        record.push(0); // n1 count
        record.push(0); // n2 count
        record.push(0); // n4 count
        record.push(0); // n8 count

        let mut payload = Vec::new();
        payload.push(CODEC8);
        payload.push(1); // record count
        payload.extend_from_slice(&record);
        payload.push(1); // record count repeated

        let mut frame = Vec::new();
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        let crc = crc16_ibm(&payload) as u32;
        frame.extend_from_slice(&crc.to_be_bytes());

        let (outcome, consumed) = decoder.decode(&frame, &client(), Some(imei));
        assert_eq!(consumed, frame.len());
        match outcome {
            DecodeOutcome::Control(ev) => {
                assert!(ev.position.is_none(), "zero-coordinate record must not surface as a position");
                assert!(ev.extra_positions.is_empty());
                assert_eq!(ev.response_bytes, Some(1u32.to_be_bytes().to_vec()));
            }
            other => panic!("expected an acked control event with no position, got {other:?}"),
        }
    }

    #[test]
    fn bad_crc_is_dropped_but_consumed() {
        let decoder = TeltonikaDecoder;
        let payload = vec![CODEC8, 0];
        let mut frame = vec![0, 0, 0, 0];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&0u32.to_be_bytes()); // wrong CRC
        let (outcome, consumed) = decoder.decode(&frame, &client(), Some("123"));
        assert_eq!(outcome, DecodeOutcome::None);
        assert_eq!(consumed, frame.len());
    }
}
