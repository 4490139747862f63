//! The `ProtocolDecoder` trait and the registry of built-in decoders.

pub mod flespi;
pub mod gt06;
pub mod h02;
pub mod meitrack;
pub mod osmand;
pub mod queclink;
pub mod teltonika;
pub mod tk103;

use crate::position::{ClientInfo, CommandInfo, CommandParams, DecodeOutcome, Transport};

/// A device wire protocol: stateless framing, checksum and field decoding.
///
/// Implementations hold no connection state of their own — everything a
/// decode needs either lives in `buf` or is passed in as `known_imei`
/// (bound by the gateway once a login frame has been seen). This is what
/// lets the same decoder instance be shared, read-only, across every
/// connection on its listener.
pub trait ProtocolDecoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn port(&self) -> u16;
    fn transport(&self) -> Transport;

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// Returns the outcome together with how many bytes were consumed.
    /// `consumed == 0` means the buffer holds less than one full frame and
    /// the caller should wait for more bytes before calling again.
    /// Implementations that detect a malformed-but-length-known frame
    /// still report a nonzero `consumed` so the gateway can resync past it.
    fn decode(
        &self,
        buf: &[u8],
        client: &ClientInfo,
        known_imei: Option<&str>,
    ) -> (DecodeOutcome, usize);

    /// Encodes a downlink command for this protocol. Panics only on a
    /// command name not present in `available_commands()` — callers are
    /// expected to check `command_info` first.
    fn encode_command(&self, command: &str, params: &CommandParams) -> Vec<u8>;

    fn available_commands(&self) -> &'static [&'static str];

    fn command_info(&self, name: &str) -> Option<CommandInfo>;

    /// Upper bound on how many bytes of unconsumed data the gateway should
    /// buffer for a connection on this protocol before giving up on it as
    /// unsynchronizable garbage.
    fn max_buffer_size(&self) -> usize {
        4096
    }
}

/// Returns one instance of every built-in decoder, in the order their
/// listeners should be opened.
pub fn builtin_decoders() -> Vec<Box<dyn ProtocolDecoder>> {
    vec![
        Box::new(teltonika::TeltonikaDecoder),
        Box::new(gt06::Gt06Decoder),
        Box::new(h02::H02Decoder),
        Box::new(tk103::Tk103Decoder),
        Box::new(meitrack::MeitrackDecoder),
        Box::new(queclink::QueclinkDecoder),
        Box::new(flespi::FlespiDecoder),
        Box::new(osmand::OsmAndDecoder),
    ]
}
