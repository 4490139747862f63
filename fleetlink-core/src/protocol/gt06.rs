//! GT06 / GT06N protocol decoder.
//!
//! Frames start with `0x7878` (short, 1-byte content length) or `0x7979`
//! (long, 2-byte content length) and end with a CRC-16/X25 over the
//! content plus a `0x0D0A` trailer.

use chrono::{DateTime, TimeZone, Utc};

use crate::checksum::crc16_x25;
use crate::position::{
    ClientInfo, CommandInfo, CommandParams, ControlEvent, DecodeOutcome, NormalizedPosition,
    SensorValue, Transport,
};
use crate::protocol::ProtocolDecoder;

const PROTO_LOGIN: u8 = 0x01;
const PROTO_POSITION: u8 = 0x12;
const PROTO_POSITION_LBS: u8 = 0x16;
const PROTO_POSITION_WIFI: u8 = 0x1A;
const PROTO_HEARTBEAT: u8 = 0x13;

pub struct Gt06Decoder;

impl Gt06Decoder {
    fn build_reply(&self, protocol_number: u8, serial: &[u8]) -> Vec<u8> {
        let mut content = vec![0x05, protocol_number];
        content.extend_from_slice(serial);
        let mut reply = vec![0x78, 0x78];
        reply.extend_from_slice(&content);
        let crc = crc16_x25(&content);
        reply.extend_from_slice(&crc.to_be_bytes());
        reply.extend_from_slice(&[0x0D, 0x0A]);
        reply
    }

    fn parse_imei(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
            .trim_start_matches('0')
            .to_string()
    }

    fn parse_position(&self, packet: &[u8], offset: usize, imei: &str) -> Option<NormalizedPosition> {
        let date_offset = offset + 1;
        if packet.len() < date_offset + 17 {
            return None;
        }
        let year = 2000 + packet[date_offset] as i32;
        let month = packet[date_offset + 1] as u32;
        let day = packet[date_offset + 2] as u32;
        let hour = packet[date_offset + 3] as u32;
        let minute = packet[date_offset + 4] as u32;
        let second = packet[date_offset + 5] as u32;
        let device_time = build_datetime(year, month, day, hour, minute, second);

        let gps_offset = date_offset + 6;
        let sat_acc = packet[gps_offset];
        let satellites = (sat_acc >> 4) & 0x0F;

        let course_status = u16::from_be_bytes([packet[gps_offset + 1], packet[gps_offset + 2]]);
        let course = (course_status & 0x03FF) as f64;
        let lat_south = course_status & 0x0400 != 0;
        let lon_west = course_status & 0x0800 != 0;
        let gps_valid = course_status & 0x1000 != 0;
        let ignition = course_status & 0x4000 != 0;

        let lat_raw = u32::from_be_bytes([
            packet[gps_offset + 3],
            packet[gps_offset + 4],
            packet[gps_offset + 5],
            packet[gps_offset + 6],
        ]);
        let mut latitude = lat_raw as f64 / 1_800_000.0;
        let lon_raw = u32::from_be_bytes([
            packet[gps_offset + 7],
            packet[gps_offset + 8],
            packet[gps_offset + 9],
            packet[gps_offset + 10],
        ]);
        let mut longitude = lon_raw as f64 / 1_800_000.0;
        if lat_south {
            latitude = -latitude;
        }
        if lon_west {
            longitude = -longitude;
        }

        let speed = packet[gps_offset + 11] as f64;

        let mut sensors = std::collections::HashMap::new();
        sensors.insert("status_raw".to_string(), SensorValue::Int(course_status as i64));
        sensors.insert("gps_tracking".to_string(), SensorValue::Bool(gps_valid));
        sensors.insert("alarm".to_string(), SensorValue::Bool(course_status & 0x0038 != 0));

        Some(
            NormalizedPosition {
                imei: imei.to_string(),
                device_time,
                server_time: Utc::now(),
                latitude,
                longitude,
                altitude: None,
                speed: Some(speed),
                course: Some(course),
                satellites: Some(satellites),
                hdop: None,
                ignition: Some(ignition),
                sensors,
                valid_fix: gps_valid,
                raw_data: None,
            }
            .sanitize(),
        )
    }
}

fn build_datetime(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month.max(1), day.max(1), hour, minute, second)
        .single()
        .unwrap_or_else(Utc::now)
}

impl ProtocolDecoder for Gt06Decoder {
    fn name(&self) -> &'static str {
        "gt06"
    }

    fn port(&self) -> u16 {
        5023
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
        if buf.len() < 5 {
            return (DecodeOutcome::None, 0);
        }
        let long_frame = buf[0] == 0x79 && buf[1] == 0x79;
        let short_frame = buf[0] == 0x78 && buf[1] == 0x78;
        if !long_frame && !short_frame {
            return (DecodeOutcome::None, 1);
        }

        let (content_len, header_len) = if short_frame {
            (buf[2] as usize, 3usize)
        } else {
            if buf.len() < 6 {
                return (DecodeOutcome::None, 0);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4usize)
        };
        // content_len spans protocol byte through CRC; the wire adds a 2-byte 0x0D0A trailer after that.
        let full_len = header_len + content_len + 2;
        if buf.len() < full_len {
            return (DecodeOutcome::None, 0);
        }

        let packet = &buf[..full_len];
        let consumed = full_len;
        let offset = header_len;
        let protocol_number = packet[offset];

        match protocol_number {
            PROTO_LOGIN => {
                let imei_bytes = &packet[offset + 1..offset + 9];
                let imei = self.parse_imei(imei_bytes);
                let serial = &packet[offset + 9..offset + 11];
                let reply = self.build_reply(PROTO_LOGIN, serial);
                (
                    DecodeOutcome::Control(ControlEvent {
                        event: "login".to_string(),
                        imei: Some(imei),
                        response_bytes: Some(reply),
                        ..Default::default()
                    }),
                    consumed,
                )
            }
            PROTO_POSITION | PROTO_POSITION_LBS | PROTO_POSITION_WIFI => {
                let Some(imei) = known_imei else {
                    return (DecodeOutcome::None, consumed);
                };
                match self.parse_position(packet, offset, imei) {
                    Some(position) => (DecodeOutcome::Position(position), consumed),
                    None => (DecodeOutcome::None, consumed),
                }
            }
            PROTO_HEARTBEAT => {
                let serial = &packet[offset + 1..offset + 3];
                let reply = self.build_reply(PROTO_HEARTBEAT, serial);
                (
                    DecodeOutcome::Control(ControlEvent {
                        event: "heartbeat".to_string(),
                        response_bytes: Some(reply),
                        ..Default::default()
                    }),
                    consumed,
                )
            }
            _ => (DecodeOutcome::None, consumed),
        }
    }

    fn encode_command(&self, command: &str, _params: &CommandParams) -> Vec<u8> {
        match command {
            "reset" => {
                let content = vec![0x01, 0x00, 0x01];
                let mut cmd = vec![0x78, 0x78, 0x05, 0x80];
                cmd.extend_from_slice(&content[1..]);
                let crc = crc16_x25(&cmd[2..]);
                cmd.extend_from_slice(&crc.to_be_bytes());
                cmd.extend_from_slice(&[0x0D, 0x0A]);
                cmd
            }
            _ => Vec::new(),
        }
    }

    fn available_commands(&self) -> &'static [&'static str] {
        &["reset"]
    }

    fn command_info(&self, name: &str) -> Option<CommandInfo> {
        match name {
            "reset" => Some(CommandInfo {
                description: "Reboot the device".to_string(),
                params: vec![],
            }),
            _ => None,
        }
    }

    fn max_buffer_size(&self) -> usize {
        2048
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientInfo {
        ClientInfo { ip: "127.0.0.1".to_string(), port: 5023 }
    }

    fn login_frame() -> Vec<u8> {
        let mut content = vec![PROTO_LOGIN];
        content.extend_from_slice(&[0x03, 0x53, 0x45, 0x12, 0x34, 0x56, 0x78, 0x90]); // 8 byte imei
        content.extend_from_slice(&[0x00, 0x01]); // serial
        let mut frame = vec![0x78, 0x78, content.len() as u8];
        frame.extend_from_slice(&content);
        let crc = crc16_x25(&content);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&[0x0D, 0x0A]);
        frame
    }

    #[test]
    fn login_frame_is_recognized_and_fully_consumed() {
        let decoder = Gt06Decoder;
        let frame = login_frame();
        let (outcome, consumed) = decoder.decode(&frame, &client(), None);
        assert_eq!(consumed, frame.len());
        match outcome {
            DecodeOutcome::Control(ev) => assert_eq!(ev.event, "login"),
            other => panic!("expected login, got {other:?}"),
        }
    }

    #[test]
    fn garbage_prefix_resyncs_one_byte_at_a_time() {
        let decoder = Gt06Decoder;
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let (outcome, consumed) = decoder.decode(&buf, &client(), None);
        assert_eq!(consumed, 1);
        assert_eq!(outcome, DecodeOutcome::None);
    }

    #[test]
    fn incomplete_short_frame_waits_for_more_bytes() {
        let decoder = Gt06Decoder;
        let buf = [0x78, 0x78, 0x20]; // claims 32 bytes of content, none present
        let (outcome, consumed) = decoder.decode(&buf, &client(), None);
        assert_eq!(consumed, 0);
        assert_eq!(outcome, DecodeOutcome::None);
    }
}
