//! Error types for wire protocol decoding.

use thiserror::Error;

/// Errors that can occur while decoding a device frame.
///
/// These never reach the wire — the gateway logs them and either resyncs
/// (advances one byte) or drops the frame, per the decoder contract.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Frame is shorter than the minimum length for its own header.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// A length field in the frame doesn't match the bytes actually present.
    #[error("length mismatch: header says {declared} bytes, buffer has {available}")]
    LengthMismatch { declared: usize, available: usize },

    /// Checksum/CRC verification failed.
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// Frame parsed structurally but a field had an impossible value.
    #[error("malformed field: {0}")]
    MalformedField(String),

    /// Text payload was not valid for the protocol's expected encoding.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Position data arrived before the connection's IMEI was known.
    #[error("no IMEI bound to this connection yet")]
    UnknownImei,

    /// Unrecognized message/command type for this protocol.
    #[error("unsupported message type: {0}")]
    Unsupported(String),
}

/// Errors from the custom-rule expression evaluator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("rule failed to compile: {0}")]
    Compile(String),
    #[error("rule evaluation error: {0}")]
    Eval(String),
}
