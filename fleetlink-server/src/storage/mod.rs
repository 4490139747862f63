//! Persistence layer: Postgres-backed repository over the device, position,
//! trip, geofence, alert-history and command-queue tables.

pub mod models;
pub mod postgres;

pub use models::*;
pub use postgres::PgStore;
