//! Process-boundary error type.
//!
//! Library code inside `fleetlink-core` returns `thiserror` enums; the
//! server wraps those (and its own I/O/database failures) in a single
//! `anyhow`-friendly enum at the subsystem boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no decoder registered for protocol {0:?}")]
    UnknownProtocol(String),

    #[error("notification delivery failed: {0}")]
    Notify(String),

    #[error(transparent)]
    Rule(#[from] fleetlink_core::RuleError),
}
