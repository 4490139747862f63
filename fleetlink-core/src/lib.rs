//! Platform-independent core of the FleetLink fleet telematics platform.
//!
//! Everything here is a pure function of its inputs: no sockets, no async
//! runtime, no database. `fleetlink-server` drives these types over real
//! connections; tests and offline replay tools can use them directly.

pub mod alert_state;
pub mod checksum;
pub mod error;
pub mod expr;
pub mod geo;
pub mod position;
pub mod protocol;

pub use error::{DecodeError, RuleError};
pub use position::{
    ClientInfo, CommandInfo, CommandParams, ControlEvent, DecodeOutcome, NormalizedPosition,
    SensorValue, Sensors, Transport,
};
pub use protocol::{builtin_decoders, ProtocolDecoder};
