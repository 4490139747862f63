//! Wire-format-independent position and control types shared by every decoder.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scalar sensor/telemetry value as decoded from a wire frame.
///
/// Kept as an open variant rather than `f64` so protocols that carry
/// strings (ICCID, cell IDs) or booleans (digital I/O) don't have to lie
/// about their type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SensorValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            SensorValue::Int(i) => Some(*i as f64),
            SensorValue::Float(f) => Some(*f),
            SensorValue::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SensorValue::Bool(b) => Some(*b),
            SensorValue::Int(i) => Some(*i != 0),
            SensorValue::Float(f) => Some(*f != 0.0),
            SensorValue::Text(_) => None,
        }
    }
}

impl From<bool> for SensorValue {
    fn from(v: bool) -> Self {
        SensorValue::Bool(v)
    }
}
impl From<i64> for SensorValue {
    fn from(v: i64) -> Self {
        SensorValue::Int(v)
    }
}
impl From<f64> for SensorValue {
    fn from(v: f64) -> Self {
        SensorValue::Float(v)
    }
}
impl From<String> for SensorValue {
    fn from(v: String) -> Self {
        SensorValue::Text(v)
    }
}
impl From<&str> for SensorValue {
    fn from(v: &str) -> Self {
        SensorValue::Text(v.to_string())
    }
}

pub type Sensors = HashMap<String, SensorValue>;

/// A single decoded GPS fix, independent of which protocol produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPosition {
    pub imei: String,
    pub device_time: DateTime<Utc>,
    pub server_time: DateTime<Utc>,
    /// Degrees, [-90, 90].
    pub latitude: f64,
    /// Degrees, [-180, 180].
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// km/h, or `None` if the fix itself is invalid.
    pub speed: Option<f64>,
    /// Degrees, [0, 360).
    pub course: Option<f64>,
    pub satellites: Option<u8>,
    pub hdop: Option<f64>,
    pub ignition: Option<bool>,
    pub sensors: Sensors,
    pub valid_fix: bool,
    pub raw_data: Option<String>,
}

impl NormalizedPosition {
    /// Clamp to the ranges the spec guarantees callers can rely on.
    ///
    /// Decoders build positions directly from wire fields that can be out
    /// of range on a corrupted frame; this normalizes rather than rejects,
    /// matching the "consume the frame, don't surface it to the device"
    /// error policy for malformed-but-parseable data.
    pub fn sanitize(mut self) -> Self {
        self.latitude = self.latitude.clamp(-90.0, 90.0);
        self.longitude = self.longitude.clamp(-180.0, 180.0);
        self.speed = self.speed.map(|s| s.clamp(0.0, 300.0));
        self.course = self.course.map(|c| c.rem_euclid(360.0));
        self
    }
}

/// Semantic event produced by a decoder alongside, or instead of, a position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub event: String,
    pub imei: Option<String>,
    /// Bytes to write back on the same connection (ACK, login response, …).
    pub response_bytes: Option<Vec<u8>>,
    /// Some protocols (Teltonika, Meitrack) bundle a position with their ACK.
    pub position: Option<NormalizedPosition>,
    /// Batched protocols (Teltonika Codec 8) can carry several fixes per frame.
    pub extra_positions: Vec<NormalizedPosition>,
    pub sensors: Sensors,
}

/// What a single `decode` call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// Not enough bytes yet, or a frame with nothing worth reporting (most
    /// heartbeats without a position).
    None,
    Position(NormalizedPosition),
    Control(ControlEvent),
}

/// Transport a decoder's listener should be opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Metadata about the peer a frame arrived from. Decoders rarely need this
/// (OsmAnd and a few ASCII dialects fall back to it when a frame carries no
/// device identifier of its own).
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: String,
    pub port: u16,
}

/// Parameters for `encode_command`, keyed the same way `AlertRow.params` is.
pub type CommandParams = HashMap<String, SensorValue>;

/// Introspection metadata for a single downlink command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub description: String,
    pub params: Vec<(String, String)>, // (name, type) pairs, e.g. ("interval", "int")
}
